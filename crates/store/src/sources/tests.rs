use std::fs;
use std::os::unix::fs::PermissionsExt;

use hashing::{ContentHash, HashAlgorithm};
use serde_json::json;

use super::*;

/// Writes a tiny POSIX `sh` "fetcher" that reads its JSON stdin, pulls the `output` directory
/// out of it with `sed` (so the test has no dependency on any JSON tooling being on PATH), and
/// then runs `body`, which can reference `$output`.
fn write_fetcher(dir: &std::path::Path, body: &str) -> PathBuf {
    let path = dir.join("fetcher.sh");
    let script = format!(
        "#!/bin/sh\nin=$(cat)\noutput=$(echo \"$in\" | sed -n 's/.*\"output\":\"\\([^\"]*\\)\".*/\\1/p')\n{body}\n"
    );
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

#[test]
fn successful_fetch_promotes_blobs_into_the_store() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = Store::new(store_dir.path()).unwrap();
    let work = tempfile::tempdir().unwrap();

    let checksum = ContentHash::of_bytes(HashAlgorithm::Sha256, b"payload");
    let fetcher = write_fetcher(
        work.path(),
        &format!("printf 'payload' > \"$output/{}\"\nprintf '{{}}'", checksum.filename()),
    );

    let req = FetchRequest {
        source_type: "org.osbuild.files".to_string(),
        fetcher_path: fetcher,
        items: json!({}),
        options: json!({}),
        checksums: vec![checksum.clone()],
    };
    let outcome = SourceFetcher::new(&store).fetch(req).unwrap();
    assert_eq!(outcome.blob_paths.len(), 1);
    assert!(outcome.blob_paths[0].ends_with(checksum.filename()));
    assert_eq!(fs::read(&outcome.blob_paths[0]).unwrap(), b"payload");
}

#[test]
fn fetcher_error_payload_surfaces_as_source_invalid() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = Store::new(store_dir.path()).unwrap();
    let work = tempfile::tempdir().unwrap();

    let fetcher = write_fetcher(work.path(), "printf '{\"error\": \"no such host\"}'\nexit 1");

    let checksum = ContentHash::of_bytes(HashAlgorithm::Sha256, b"payload");
    let req = FetchRequest {
        source_type: "org.osbuild.files".to_string(),
        fetcher_path: fetcher,
        items: json!({}),
        options: json!({}),
        checksums: vec![checksum],
    };
    let err = SourceFetcher::new(&store).fetch(req).unwrap_err();
    assert!(matches!(err, StoreError::SourceInvalid(_)));
}

#[test]
fn missing_requested_blob_is_rejected() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = Store::new(store_dir.path()).unwrap();
    let work = tempfile::tempdir().unwrap();

    let fetcher = write_fetcher(work.path(), "printf '{}'");

    let checksum = ContentHash::of_bytes(HashAlgorithm::Sha256, b"payload");
    let req = FetchRequest {
        source_type: "org.osbuild.files".to_string(),
        fetcher_path: fetcher,
        items: json!({}),
        options: json!({}),
        checksums: vec![checksum],
    };
    let err = SourceFetcher::new(&store).fetch(req).unwrap_err();
    assert!(matches!(err, StoreError::SourceInvalid(_)));
}

#[test]
fn tampered_blob_is_rejected_even_if_present() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = Store::new(store_dir.path()).unwrap();
    let work = tempfile::tempdir().unwrap();

    let checksum = ContentHash::of_bytes(HashAlgorithm::Sha256, b"payload");
    // Fetcher writes *some* file under the expected name, but with the wrong content.
    let fetcher = write_fetcher(
        work.path(),
        &format!("printf 'tampered' > \"$output/{}\"\nprintf '{{}}'", checksum.filename()),
    );

    let req = FetchRequest {
        source_type: "org.osbuild.files".to_string(),
        fetcher_path: fetcher,
        items: json!({}),
        options: json!({}),
        checksums: vec![checksum],
    };
    let err = SourceFetcher::new(&store).fetch(req).unwrap_err();
    assert!(matches!(err, StoreError::SourceInvalid(_)));
}
