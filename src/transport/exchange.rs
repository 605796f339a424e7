//! Exchange transport.
//!
//! Commands are batched into whole files. The writer only produces a file once
//! the counterpart has consumed (deleted) the previous one, writes it to a
//! temp path and renames it into place. Every file ends with a blake3 hash
//! of its body so a partially replicated file is rejected instead of parsed.

use std::io::{self, Cursor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::{short_name, FileAccess, Transport};
use crate::channel::ChannelCore;
use crate::command;
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::timing::RESTART_DELAY;
use crate::protocol::{CONTENT_HASH_LEN, EXCHANGE_SEND_QUEUE_CAPACITY, TEMP_SUFFIX};
use crate::retry::Retry;

pub struct ExchangeTransport {
    read_path: PathBuf,
    write_path: PathBuf,
    temp_path: PathBuf,
    max_file_size: u64,
    read_duration: Duration,
    timeout: Duration,
    access: Arc<dyn FileAccess>,
}

impl ExchangeTransport {
    pub fn new(config: &TunnelConfig, access: Arc<dyn FileAccess>) -> Self {
        let mut temp = config.write.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        ExchangeTransport {
            read_path: config.read.clone(),
            write_path: config.write.clone(),
            temp_path: PathBuf::from(temp),
            max_file_size: config.purge_size,
            read_duration: config.read_duration(),
            timeout: config.tunnel_timeout(),
            access,
        }
    }

    /// Wait until the counterpart has picked up our previous file.
    fn wait_until_consumed(&self, core: &ChannelCore) -> Result<()> {
        let operation = format!("Wait for {} to be consumed", short_name(&self.write_path));
        loop {
            match Retry::new(operation.as_str(), self.timeout)
                .stop_on(core.stop_flag())
                .run(|_| {}, |_| !self.access.exists(&self.write_path))
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_timeout() => debug!("{e}"),
                Err(e) => return Err(e),
            }
        }
    }

    /// Collect queued commands into one file and publish it. Returns false
    /// once the channel has been halted.
    fn send_batch(&self, core: &ChannelCore, buf: &mut Vec<u8>) -> Result<bool> {
        let Some(first) = core.next_outgoing() else {
            return Ok(false);
        };

        buf.clear();
        let started = Instant::now();
        let mut commands = 0usize;
        let mut payload_bytes = 0u64;
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            let number = core.stamp(&cmd);
            cmd.encode(number, buf);
            payload_bytes += cmd.payload_len() as u64;
            commands += 1;

            if buf.len() as u64 >= self.max_file_size || started.elapsed() >= self.read_duration {
                break;
            }
            next = core.try_next_outgoing();
        }

        let hash = blake3::hash(buf.as_slice());
        buf.extend_from_slice(hash.as_bytes());

        let stop = core.stop_flag();
        let expected = buf.len() as u64;
        let data = buf.as_slice();
        Retry::new(format!("Write {}", short_name(&self.temp_path)), self.timeout)
            .stop_on(stop)
            .run(
                |attempt| {
                    if let Err(e) = self.access.write_all(&self.temp_path, data) {
                        debug!(attempt = attempt.number, "write failed: {e}");
                    }
                },
                |_| self.access.size(&self.temp_path).is_ok_and(|size| size == expected),
            )?;
        Retry::new(format!("Rename to {}", short_name(&self.write_path)), self.timeout)
            .stop_on(stop)
            .until_ok(|| self.access.rename(&self.temp_path, &self.write_path))?;

        core.sent().add(payload_bytes);
        debug!(commands, bytes = expected, "published file");
        Ok(true)
    }

    fn receive_file(&self, core: &ChannelCore) -> Result<()> {
        let stop = core.stop_flag();
        let name = short_name(&self.read_path);

        let wait = format!("Wait for {name}");
        loop {
            match Retry::new(wait.as_str(), self.timeout)
                .stop_on(stop)
                .run(|_| {}, |_| self.access.exists(&self.read_path))
            {
                Ok(_) => break,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }

        let data = Retry::new(format!("Read {name}"), self.timeout)
            .stop_on(stop)
            .until_ok(|| match self.access.read_all(&self.read_path) {
                Ok(d) if d.is_empty() => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file is still empty",
                )),
                other => other,
            })?;
        Retry::new(format!("Delete {name}"), self.timeout)
            .stop_on(stop)
            .until_ok(|| self.access.delete(&self.read_path))?;

        let body = verify(&data, &name)?;
        let mut cursor = Cursor::new(body);
        let mut commands = 0usize;
        while let Some(packet) = command::decode(&mut cursor)? {
            core.dispatch(packet);
            commands += 1;
        }
        debug!(commands, bytes = data.len(), "consumed file");
        Ok(())
    }
}

impl Transport for ExchangeTransport {
    fn name(&self) -> &'static str {
        "exchange"
    }

    fn send_queue_capacity(&self) -> usize {
        EXCHANGE_SEND_QUEUE_CAPACITY
    }

    /// Leftovers from a previous run would be mistaken for fresh data.
    fn prepare(&self) -> Result<()> {
        for path in [&self.write_path, &self.temp_path, &self.read_path] {
            if self.access.exists(path) {
                debug!("deleting stale {}", path.display());
                Retry::new(format!("Delete {}", short_name(path)), self.timeout)
                    .until_ok(|| self.access.delete(path))?;
            }
        }
        Ok(())
    }

    fn send_pump(&self, core: &ChannelCore) -> Result<()> {
        let mut buf = Vec::new();
        loop {
            let sent = self
                .wait_until_consumed(core)
                .and_then(|()| self.send_batch(core, &mut buf));
            match sent {
                Ok(true) => {}
                Ok(false) | Err(TunnelError::Shutdown) => return Ok(()),
                Err(e) => {
                    warn!("{e}, retrying");
                    if !core.pause(RESTART_DELAY) {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn receive_pump(&self, core: &ChannelCore) -> Result<()> {
        loop {
            if core.is_stopped() {
                return Ok(());
            }
            match self.receive_file(core) {
                Ok(()) => {}
                Err(TunnelError::Shutdown) => return Ok(()),
                Err(e) => {
                    if e.is_protocol_violation() {
                        error!("{e}");
                    } else {
                        warn!("{e}");
                    }
                    if !core.pause(RESTART_DELAY) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Split off and check the trailing hash, returning the command bytes.
fn verify<'a>(data: &'a [u8], name: &str) -> Result<&'a [u8]> {
    if data.len() < CONTENT_HASH_LEN {
        return Err(TunnelError::HashMismatch(name.to_string()));
    }
    let (body, expected) = data.split_at(data.len() - CONTENT_HASH_LEN);
    if blake3::hash(body).as_bytes() != expected {
        return Err(TunnelError::HashMismatch(name.to_string()));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Ping};
    use crate::config::TransportMode;
    use crate::transport::LocalAccess;

    fn sealed(commands: &[Command]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, c) in commands.iter().enumerate() {
            c.encode(i as u64, &mut buf);
        }
        let hash = blake3::hash(&buf);
        buf.extend_from_slice(hash.as_bytes());
        buf
    }

    #[test]
    fn verify_accepts_intact_file() {
        let data = sealed(&[Command::Ping(Ping::Request)]);
        let body = verify(&data, "x").unwrap();
        assert_eq!(body.len(), data.len() - CONTENT_HASH_LEN);
    }

    #[test]
    fn verify_rejects_corruption_and_truncation() {
        let mut data = sealed(&[Command::Connect { connection_id: 1 }]);
        assert!(matches!(
            verify(&data[..10], "x"),
            Err(TunnelError::HashMismatch(_))
        ));
        data[2] ^= 0xff;
        assert!(matches!(verify(&data, "x"), Err(TunnelError::HashMismatch(_))));
    }

    #[test]
    fn prepare_removes_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TunnelConfig::new(dir.path().join("in.dat"), dir.path().join("out.dat"));
        config.mode = TransportMode::Exchange;
        let transport = ExchangeTransport::new(&config, Arc::new(LocalAccess));

        std::fs::write(&config.read, b"stale").unwrap();
        std::fs::write(&config.write, b"stale").unwrap();
        std::fs::write(dir.path().join("out.dat.tmp"), b"stale").unwrap();

        transport.prepare().unwrap();
        assert!(!config.read.exists());
        assert!(!config.write.exists());
        assert!(!dir.path().join("out.dat.tmp").exists());
    }

    #[test]
    fn batch_is_published_with_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TunnelConfig::new(dir.path().join("in.dat"), dir.path().join("out.dat"));
        config.mode = TransportMode::Exchange;
        let transport = ExchangeTransport::new(&config, Arc::new(LocalAccess));
        let core = ChannelCore::new(config.clone(), EXCHANGE_SEND_QUEUE_CAPACITY);

        core.enqueue(Command::Connect { connection_id: 4 }).unwrap();
        core.enqueue(Command::Forward {
            connection_id: 4,
            payload: b"abc".to_vec(),
        })
        .unwrap();

        let mut buf = Vec::new();
        assert!(transport.send_batch(&core, &mut buf).unwrap());

        let data = std::fs::read(&config.write).unwrap();
        let body = verify(&data, "out.dat").unwrap();
        let mut cursor = Cursor::new(body);
        let first = command::decode(&mut cursor).unwrap().unwrap();
        let second = command::decode(&mut cursor).unwrap().unwrap();
        assert_eq!(first.command, Command::Connect { connection_id: 4 });
        assert!(second.number > first.number);
        assert!(command::decode(&mut cursor).unwrap().is_none());
        assert!(!dir.path().join("out.dat.tmp").exists());
    }
}
