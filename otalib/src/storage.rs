use std::{io, path::Path};

/// Space that must remain free after the artifact has been stored.
pub const SAFETY_MARGIN: u64 = 25 * 1024 * 1024;

/// Source of free-space information for the download directory.
pub trait StorageProbe: Send + Sync {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64>;
}

/// Whether `available` bytes are enough to store `required` bytes while
/// keeping [`SAFETY_MARGIN`] free.
pub fn has_room_for(available: u64, required: u64) -> bool {
    available.saturating_sub(SAFETY_MARGIN) >= required
}

/// Queries the filesystem containing the directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStorageProbe;

impl StorageProbe for FsStorageProbe {
    #[cfg(unix)]
    fn available_bytes(&self, dir: &Path) -> io::Result<u64> {
        use std::{ffi::CString, mem::MaybeUninit, os::unix::ffi::OsStrExt};

        let c_path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();

        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let stat = unsafe { stat.assume_init() };

        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

/// Reports a fixed amount of free space.
#[derive(Clone, Copy, Debug)]
pub struct FixedStorageProbe(pub u64);

impl StorageProbe for FixedStorageProbe {
    fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_has_room_for() {
        let usable = 500 * MIB;

        assert!(has_room_for(usable, usable - 25 * MIB));
        assert!(has_room_for(usable, 100 * MIB));
        assert!(!has_room_for(usable, usable - 20 * MIB));
        assert!(!has_room_for(usable, usable));
        assert!(!has_room_for(10 * MIB, 1));
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_probe() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsStorageProbe.available_bytes(dir.path()).is_ok());
        assert!(FsStorageProbe.available_bytes(&dir.path().join("missing")).is_err());
    }
}
