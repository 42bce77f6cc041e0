use super::*;

fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();
    (dir, store)
}

fn fingerprint_of(byte: u8) -> Fingerprint {
    Fingerprint::from_bytes_unsafe(&[byte; hashing::FINGERPRINT_SIZE])
}

#[test]
fn new_creates_the_expected_layout() {
    let (dir, _store) = open_store();
    assert!(dir.path().join("objects").is_dir());
    assert!(dir.path().join("refs").is_dir());
    assert!(dir.path().join("sources").is_dir());
    assert!(dir.path().join("tmp").is_dir());
}

#[test]
fn commit_promotes_staged_object_and_makes_it_read_only() {
    let (_dir, store) = open_store();
    let staged = store.new_object().unwrap();
    fs::write(staged.path().join("hello"), b"world").unwrap();

    let id = ObjectId::from_fingerprint(fingerprint_of(1));
    let committed = store.commit(staged, id).unwrap();

    assert!(store.contains(id));
    assert_eq!(store.object_path(id).unwrap(), committed);
    assert_eq!(fs::read(committed.join("hello")).unwrap(), b"world");

    let perms = fs::metadata(committed.join("hello")).unwrap().permissions();
    assert!(perms.readonly());
}

#[test]
fn commit_is_idempotent_on_collision() {
    let (_dir, store) = open_store();
    let id = ObjectId::from_fingerprint(fingerprint_of(2));

    let first = store.new_object().unwrap();
    fs::write(first.path().join("a"), b"first").unwrap();
    let first_path = store.commit(first, id).unwrap();

    let second = store.new_object().unwrap();
    fs::write(second.path().join("a"), b"second").unwrap();
    let second_path = store.commit(second, id).unwrap();

    assert_eq!(first_path, second_path);
    assert_eq!(fs::read(first_path.join("a")).unwrap(), b"first");
}

#[test]
fn dropping_an_uncommitted_staged_object_removes_its_directory() {
    let (_dir, store) = open_store();
    let staged = store.new_object().unwrap();
    let path = staged.path().to_path_buf();
    fs::write(path.join("scratch"), b"x").unwrap();
    assert!(path.exists());

    drop(staged);

    assert!(!path.exists());
}

#[test]
fn object_path_of_unknown_id_is_not_found() {
    let (_dir, store) = open_store();
    let id = ObjectId::from_fingerprint(fingerprint_of(3));
    assert!(!store.contains(id));
    assert!(matches!(store.object_path(id), Err(StoreError::NotFound(_))));
}

#[test]
fn snapshot_produces_a_writable_independent_clone() {
    let (_dir, store) = open_store();
    let staged = store.new_object().unwrap();
    fs::write(staged.path().join("f"), b"orig").unwrap();
    let id = ObjectId::from_fingerprint(fingerprint_of(4));
    store.commit(staged, id).unwrap();

    let snapshot = store.snapshot(id).unwrap();
    fs::write(snapshot.path().join("f"), b"changed").unwrap();
    assert_eq!(fs::read(snapshot.path().join("f")).unwrap(), b"changed");

    // the committed object itself must be untouched.
    let committed = store.object_path(id).unwrap();
    assert_eq!(fs::read(committed.join("f")).unwrap(), b"orig");
}

#[test]
fn dropping_a_snapshot_removes_its_directory() {
    let (_dir, store) = open_store();
    let staged = store.new_object().unwrap();
    let id = ObjectId::from_fingerprint(fingerprint_of(5));
    store.commit(staged, id).unwrap();

    let snapshot = store.snapshot(id).unwrap();
    let path = snapshot.path().to_path_buf();
    drop(snapshot);
    assert!(!path.exists());
}

#[test]
fn source_creates_and_reuses_the_same_directory() {
    let (_dir, store) = open_store();
    let first = store.source("org.osbuild.files").unwrap();
    fs::write(first.join("blob"), b"data").unwrap();
    let second = store.source("org.osbuild.files").unwrap();
    assert_eq!(first, second);
    assert_eq!(fs::read(second.join("blob")).unwrap(), b"data");
}

#[test]
fn mkdtemp_allocates_under_the_given_parent() {
    let (dir, store) = open_store();
    let parent = dir.path().join("sandbox-root");
    let scratch = store.mkdtemp(&parent, "work-").unwrap();
    assert!(scratch.starts_with(&parent));
    assert!(scratch.is_dir());
}

#[test]
fn set_ref_and_get_ref_round_trip() {
    let (_dir, store) = open_store();
    let id = ObjectId::from_fingerprint(fingerprint_of(6));
    store.set_ref("tree", id).unwrap();
    assert_eq!(store.get_ref("tree").unwrap(), id);
}

#[test]
fn get_ref_of_unknown_name_is_not_found() {
    let (_dir, store) = open_store();
    assert!(matches!(store.get_ref("nope"), Err(StoreError::NotFound(_))));
}

#[test]
fn object_id_round_trips_through_its_string_form() {
    let id = ObjectId::from_fingerprint(fingerprint_of(7));
    let parsed: ObjectId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}
