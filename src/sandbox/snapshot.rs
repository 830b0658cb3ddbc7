//! Workspace copies backing snapshots
//!
//! These are blocking filesystem walks; callers run them on
//! `tokio::task::spawn_blocking`.

use std::fs;
use std::io;
use std::path::Path;

/// Recursively copy `src` into `dst` (created if missing).
///
/// Symlinks are recreated as links, not followed. Returns the number of
/// bytes copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if file_type.is_file() {
            copied += fs::copy(&from, &to)?;
        }
        // sockets, fifos and devices are skipped
    }

    Ok(copied)
}

/// Total size in bytes of the regular files under `path`
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Remove a directory tree, treating "already gone" as success
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
