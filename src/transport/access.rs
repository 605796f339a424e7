//! Whole-file operations used by the exchange transport.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

pub trait FileAccess: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write_all(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn delete(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn size(&self, path: &Path) -> io::Result<u64>;
}

/// Direct filesystem access.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAccess;

impl FileAccess for LocalAccess {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        fs::metadata(path).map(|m| m.len())
    }
}

/// Sleeps before every operation. Keeps request rates down on remote shares
/// that throttle or bill per call.
pub struct PacedAccess<A> {
    inner: A,
    pace: Duration,
}

impl<A: FileAccess> PacedAccess<A> {
    pub fn new(inner: A, pace: Duration) -> Self {
        PacedAccess { inner, pace }
    }

    fn wait(&self) {
        if !self.pace.is_zero() {
            thread::sleep(self.pace);
        }
    }
}

impl<A: FileAccess> FileAccess for PacedAccess<A> {
    fn exists(&self, path: &Path) -> bool {
        self.wait();
        self.inner.exists(path)
    }

    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.wait();
        self.inner.read_all(path)
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.wait();
        self.inner.write_all(path, data)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        self.wait();
        self.inner.delete(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.wait();
        self.inner.rename(from, to)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        self.wait();
        self.inner.size(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn delete_of_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        LocalAccess.delete(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn write_rename_read() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("x.tmp");
        let dst = dir.path().join("x");
        let fs = LocalAccess;

        fs.write_all(&tmp, b"payload").unwrap();
        assert_eq!(fs.size(&tmp).unwrap(), 7);
        fs.rename(&tmp, &dst).unwrap();
        assert!(!fs.exists(&tmp));
        assert_eq!(fs.read_all(&dst).unwrap(), b"payload");
    }

    #[test]
    fn paced_access_waits() {
        let dir = tempfile::tempdir().unwrap();
        let fs = PacedAccess::new(LocalAccess, Duration::from_millis(20));
        let started = Instant::now();
        assert!(!fs.exists(&dir.path().join("a")));
        assert!(!fs.exists(&dir.path().join("b")));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
