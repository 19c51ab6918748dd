use std::{
    ffi::OsString,
    fs,
    io,
    path::{Path, PathBuf},
};

use log::{debug, warn};

/// Add an extension to a file path.
pub fn add_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Delete a file, but don't error out if the path doesn't exist. Returns
/// whether a file was actually removed.
pub fn delete_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Get the size of a file or [`None`] if it doesn't exist.
pub fn file_len(path: &Path) -> io::Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(m) => Ok(Some(m.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Move a completed download to its published location. An existing
/// destination is deleted first. If the rename fails (eg. because the paths
/// are on different filesystems), the file is copied and the source removed.
pub fn persist_file(src: &Path, dest: &Path) -> io::Result<()> {
    if delete_if_exists(dest)? {
        debug!("Deleted existing file at {:?}", dest);
    }

    match fs::rename(src, dest) {
        Ok(_) => return Ok(()),
        Err(e) => warn!("Could not rename {:?} to {:?}; falling back to copy: {}", src, dest, e),
    }

    if let Err(e) = fs::copy(src, dest) {
        // Don't leave a partial copy behind that looks like a finished download
        let _ = delete_if_exists(dest);
        return Err(e);
    }

    fs::remove_file(src)
}
