// Filesystem cloning: prefer a CoW reflink, then a hardlink, then a deep copy (spec §4.1, §9).
//
// The capability is detected once (the first file clone in a process lifetime) and cached on
// the `Store` handle, rather than re-probed per file, matching the spec's "detect by attempting
// it once per mount, cache the capability" policy. Hardlinking is safe here specifically because
// stages are contractually required to unlink-then-rewrite rather than edit files in place
// (spec §4.1): a hardlinked clone that a stage edits in place would otherwise corrupt the
// original committed object.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use std::sync::Mutex;

use crate::StoreError;

pub fn clone_tree(
    src: &Path,
    dst: &Path,
    reflink_capable: &Mutex<Option<bool>>,
) -> Result<(), StoreError> {
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under the root it was given");
        let dest_path = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            symlink(&target, &dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            clone_file(entry.path(), &dest_path, reflink_capable)?;
        }
    }
    // Directories need their write bit restored so the clone is actually writable, since the
    // source tree we're cloning from is typically a read-only committed object.
    for entry in walkdir::WalkDir::new(dst) {
        let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
        if entry.file_type().is_dir() {
            let mut perms = fs::metadata(entry.path())?.permissions();
            let mode = perms.mode() | 0o200;
            perms.set_mode(mode);
            fs::set_permissions(entry.path(), perms)?;
        }
    }
    Ok(())
}

fn clone_file(src: &Path, dst: &Path, reflink_capable: &Mutex<Option<bool>>) -> Result<(), StoreError> {
    let capability = *reflink_capable.lock().unwrap();
    match capability {
        Some(true) => {
            if reflink_copy::reflink(src, dst).is_ok() {
                return Ok(());
            }
            // A previously-capable mount can still reject an individual reflink (e.g. cross
            // mount-point); fall through to the hardlink/copy path below for this file only.
        }
        Some(false) => {}
        None => match reflink_copy::reflink(src, dst) {
            Ok(()) => {
                *reflink_capable.lock().unwrap() = Some(true);
                return Ok(());
            }
            Err(_) => {
                *reflink_capable.lock().unwrap() = Some(false);
            }
        },
    }

    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)?;
    Ok(())
}
