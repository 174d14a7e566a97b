//! Free disk space probing.

use crate::error::Result;
use std::fmt::Debug;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reports how many bytes are available to unprivileged writers on the file
/// system holding `path`.
pub trait FreeDiskSpace: Debug + Send + Sync {
    fn available(&self, path: &Path) -> Result<u64>;
}

/// Asks the operating system via `statvfs(3)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatvfsFreeDiskSpace;

impl FreeDiskSpace for StatvfsFreeDiskSpace {
    #[cfg(unix)]
    fn available(&self, path: &Path) -> Result<u64> {
        use crate::error::ErrorKind;
        use exn::ResultExt;

        let stat = rustix::fs::statvfs(path).or_raise(|| ErrorKind::Failed(path.to_path_buf()))?;
        Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
    }

    #[cfg(not(unix))]
    fn available(&self, _path: &Path) -> Result<u64> {
        Ok(u64::MAX)
    }
}

/// Reports whatever it was last told to. Meant for tests (including other
/// crates' tests), so it isn't behind `#[cfg(test)]`.
#[derive(Debug, Default)]
pub struct FixedFreeDiskSpace(AtomicU64);

impl FixedFreeDiskSpace {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl FreeDiskSpace for FixedFreeDiskSpace {
    fn available(&self, _path: &Path) -> Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_statvfs_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatvfsFreeDiskSpace.available(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_statvfs_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        if cfg!(unix) {
            assert!(StatvfsFreeDiskSpace.available(&missing).is_err());
        }
    }

    #[test]
    fn test_fixed() {
        let space = FixedFreeDiskSpace::new(10);
        assert_eq!(space.available(Path::new("/")).unwrap(), 10);
        space.set(20);
        assert_eq!(space.available(Path::new("/")).unwrap(), 20);
    }
}
