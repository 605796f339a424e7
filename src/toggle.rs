//! One-byte out-of-band flags at fixed file offsets.
//!
//! A single byte write is the only atomicity relied on, and only for coarse
//! two-phase handshakes. Never for data.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, TunnelError};
use crate::protocol::timing::FLAG_POLL;

/// Writer side of a flag.
pub struct ToggleWriter {
    file: File,
    offset: u64,
}

impl ToggleWriter {
    pub fn open(path: &Path, offset: u64) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self { file, offset })
    }

    pub fn set(&mut self, value: u8) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.write_all(&[value])?;
        self.file.flush()?;
        Ok(())
    }
}

/// Reader side of a flag. Each poll re-reads the byte from the file.
pub struct ToggleReader {
    file: File,
    offset: u64,
    name: &'static str,
}

impl ToggleReader {
    pub fn open(path: &Path, offset: u64, name: &'static str) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { file, offset, name })
    }

    /// Current value; a file shorter than the offset reads as 0.
    pub fn get(&mut self) -> Result<u8> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        let mut b = [0u8; 1];
        let n = self.file.read(&mut b)?;
        Ok(if n == 0 { 0 } else { b[0] })
    }

    /// Block until the flag reads `value`, polling at a fixed short interval.
    pub fn wait_until(&mut self, value: u8, timeout: Duration, stop: &AtomicBool) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.get()? == value {
                return Ok(());
            }
            if stop.load(Ordering::Relaxed) {
                return Err(TunnelError::Shutdown);
            }
            if started.elapsed() >= timeout {
                return Err(TunnelError::timeout(
                    format!("Wait for {} to become {value}", self.name),
                    timeout,
                ));
            }
            thread::sleep(FLAG_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reader_observes_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.dat");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let mut writer = ToggleWriter::open(&path, 8).unwrap();
        let mut reader = ToggleReader::open(&path, 8, "ready").unwrap();
        assert_eq!(reader.get().unwrap(), 0);

        writer.set(1).unwrap();
        assert_eq!(reader.get().unwrap(), 1);
        // Neighbouring bytes are untouched
        assert_eq!(std::fs::read(&path).unwrap()[9], 0);
    }

    #[test]
    fn wait_until_sees_change_from_other_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.dat");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let mut reader = ToggleReader::open(&path, 9, "complete").unwrap();
        let p = path.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            ToggleWriter::open(&p, 9).unwrap().set(1).unwrap();
        });

        let stop = AtomicBool::new(false);
        reader
            .wait_until(1, Duration::from_secs(5), &stop)
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn wait_until_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.dat");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let mut reader = ToggleReader::open(&path, 8, "ready").unwrap();
        let stop = AtomicBool::new(false);
        let err = reader
            .wait_until(1, Duration::from_millis(20), &stop)
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn wait_until_honours_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.dat");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let mut reader = ToggleReader::open(&path, 8, "ready").unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let err = reader
            .wait_until(1, Duration::from_secs(60), &stop)
            .unwrap_err();
        assert!(matches!(err, TunnelError::Shutdown));
    }
}
