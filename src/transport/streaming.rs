//! Streaming transport.
//!
//! Each side owns one write file that it appends commands to, and tails the
//! counterpart's write file. The first bytes of every file are a header:
//! session id, then two handshake flags (see [`crate::protocol::layout`]).
//!
//! When the write file would grow past the purge size the writer sends a
//! Purge command and truncates only after the reader has acknowledged it:
//!
//! ```text
//! writer                           reader (counterpart)
//! Purge  ------------------------> sees Purge
//!        <------------------------ ready = 1   (in its own write file)
//! truncate, complete = 1 --------> seek to header end
//!        <------------------------ ready = 0
//! complete = 0 ------------------> resumes tailing
//! ```
//!
//! A counterpart that never acknowledges gets a fresh session id instead: its
//! reader notices the change and starts over from the header.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::{short_name, Transport};
use crate::channel::ChannelCore;
use crate::command::{self, Command};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::layout::{
    MESSAGE_WRITE_POS, PURGE_COMPLETE_FLAG, READY_FOR_PURGE_FLAG, SESSION_ID,
};
use crate::protocol::timing::{FILE_APPEAR_POLL, RESTART_DELAY, SESSION_CHECK, TAIL_POLL};
use crate::protocol::STREAMING_SEND_QUEUE_CAPACITY;
use crate::toggle::{ToggleReader, ToggleWriter};

const READ_AHEAD: usize = 256 * 1024;

pub struct StreamingTransport {
    read_path: PathBuf,
    write_path: PathBuf,
    purge_size: u64,
    timeout: Duration,
    write_file: Mutex<Option<File>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartAt {
    /// Skip whatever the file already holds
    Tail,
    /// Read everything after the header
    Beginning,
}

impl StreamingTransport {
    pub fn new(config: &TunnelConfig) -> Self {
        StreamingTransport {
            read_path: config.read.clone(),
            write_path: config.write.clone(),
            purge_size: config.purge_size,
            timeout: config.tunnel_timeout(),
            write_file: Mutex::new(None),
        }
    }

    fn purge(&self, core: &ChannelCore, w: &mut StreamWriter) -> Result<()> {
        info!(size = w.pos, "asking counterpart to prepare for purge");
        let number = core.stamp(&Command::Purge);
        w.append(&Command::Purge.to_bytes(number))?;

        let stop = core.stop_flag();
        let mut ready =
            match ToggleReader::open(&self.read_path, READY_FOR_PURGE_FLAG, "ready-for-purge") {
                Ok(r) => r,
                Err(e) => {
                    warn!("cannot watch counterpart's ready flag ({e}), starting a new session");
                    return w.rotate();
                }
            };

        match ready.wait_until(1, self.timeout, stop) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!("{e}, starting a new session");
                return w.rotate();
            }
            Err(e) => return Err(e),
        }

        w.truncate()?;
        w.complete.set(1)?;

        match ready.wait_until(0, self.timeout, stop) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => warn!("{e}"),
            Err(e) => return Err(e),
        }
        w.complete.set(0)?;
        info!("purge complete");
        Ok(())
    }

    /// Open the counterpart's file and position the tail.
    fn establish<'a>(
        &self,
        core: &'a ChannelCore,
        start_at: StartAt,
    ) -> Result<Option<Session<'a>>> {
        let existed = has_content(&self.read_path);
        if !existed {
            info!("waiting for counterpart to create {}", self.read_path.display());
            while !has_content(&self.read_path) {
                if !core.pause(FILE_APPEAR_POLL) {
                    return Ok(None);
                }
            }
        }

        // Zero until the writer has finished creating the header
        let session_id = loop {
            match read_session(&self.read_path)? {
                0 => {
                    if !core.pause(TAIL_POLL) {
                        return Ok(None);
                    }
                }
                id => break id,
            }
        };
        let file = File::open(&self.read_path)?;
        let position = if existed && start_at == StartAt::Tail {
            file.metadata()?.len().max(MESSAGE_WRITE_POS)
        } else {
            MESSAGE_WRITE_POS
        };

        // A restart may have left our acknowledgement raised
        let mut ready = ToggleWriter::open(&self.write_path, READY_FOR_PURGE_FLAG)?;
        ready.set(0)?;
        let complete = ToggleReader::open(&self.read_path, PURGE_COMPLETE_FLAG, "purge-complete")?;

        info!(session = session_id, position, "following counterpart's file");
        Ok(Some(Session {
            tail: TailReader::new(file, position, self.timeout, core.stop_flag()),
            path: self.read_path.clone(),
            session_id,
            ready,
            complete,
        }))
    }

    /// Decode and dispatch commands until the session ends.
    fn follow(&self, core: &ChannelCore, s: &mut Session) -> Result<()> {
        let mut last_check = Instant::now();
        loop {
            if core.is_stopped() {
                return Ok(());
            }
            if !s.tail.has_command()? {
                if last_check.elapsed() >= SESSION_CHECK {
                    s.check()?;
                    last_check = Instant::now();
                }
                thread::sleep(TAIL_POLL);
                continue;
            }

            let at = s.tail.position();
            let packet = match command::decode(&mut s.tail) {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(e) => {
                    // A recreated file reads as garbage from the old position
                    s.check()?;
                    if e.is_protocol_violation() {
                        error!(position = at, "could not read command: {e}");
                    }
                    return Err(e);
                }
            };

            trace!(
                packet = packet.number,
                command = packet.command.name(),
                position = at,
                "received"
            );
            if packet.command == Command::Purge {
                core.liveness().touch();
                self.follow_purge(core, s)?;
            } else {
                core.dispatch(packet);
            }
        }
    }

    fn follow_purge(&self, core: &ChannelCore, s: &mut Session) -> Result<()> {
        info!("counterpart is about to purge its file");
        let stop = core.stop_flag();

        s.ready.set(1)?;
        if let Err(e) = s.complete.wait_until(1, self.timeout, stop) {
            s.check()?;
            return Err(e);
        }
        s.tail.seek_to(MESSAGE_WRITE_POS);
        s.ready.set(0)?;
        if let Err(e) = s.complete.wait_until(0, self.timeout, stop) {
            s.check()?;
            return Err(e);
        }
        debug!("counterpart finished purging");
        Ok(())
    }
}

impl Transport for StreamingTransport {
    fn name(&self) -> &'static str {
        "streaming"
    }

    fn send_queue_capacity(&self) -> usize {
        STREAMING_SEND_QUEUE_CAPACITY
    }

    fn prepare(&self) -> Result<()> {
        let (file, session) = create_session_file(&self.write_path)?;
        info!(session, "created {}", self.write_path.display());
        *self.write_file.lock() = Some(file);
        Ok(())
    }

    fn send_pump(&self, core: &ChannelCore) -> Result<()> {
        let file = match self.write_file.lock().take() {
            Some(f) => f,
            None => create_session_file(&self.write_path)?.0,
        };
        let mut writer = StreamWriter::new(file, &self.write_path)?;
        let mut buf = Vec::with_capacity(64 * 1024);

        while let Some(command) = core.next_outgoing() {
            if self.purge_size > 0
                && writer.pos > MESSAGE_WRITE_POS
                && writer.pos + command.encoded_len() as u64 > self.purge_size
            {
                self.purge(core, &mut writer)?;
                core.record_purge();
            }

            let number = core.stamp(&command);
            buf.clear();
            command.encode(number, &mut buf);
            writer.append(&buf)?;
            trace!(
                packet = number,
                command = command.name(),
                bytes = buf.len(),
                "wrote"
            );
            core.record_sent(&command);
        }
        Ok(())
    }

    fn receive_pump(&self, core: &ChannelCore) -> Result<()> {
        let mut start_at = StartAt::Tail;
        loop {
            let outcome = self.establish(core, start_at).and_then(|session| match session {
                Some(mut s) => self.follow(core, &mut s),
                None => Ok(()),
            });

            start_at = match outcome {
                Ok(()) | Err(TunnelError::Shutdown) => return Ok(()),
                Err(e) if e.is_protocol_violation() => return Err(e),
                Err(e @ TunnelError::SessionChanged(_)) => {
                    info!("{e}, restarting from the beginning");
                    StartAt::Beginning
                }
                Err(e) => {
                    if core.is_stopped() {
                        return Ok(());
                    }
                    warn!("{e}, restarting");
                    if !core.pause(RESTART_DELAY) {
                        return Ok(());
                    }
                    StartAt::Tail
                }
            };
        }
    }
}

/// Write side of the streaming file.
struct StreamWriter {
    file: File,
    pos: u64,
    complete: ToggleWriter,
}

impl StreamWriter {
    fn new(mut file: File, path: &Path) -> Result<Self> {
        file.seek(SeekFrom::Start(MESSAGE_WRITE_POS))?;
        Ok(StreamWriter {
            file,
            pos: MESSAGE_WRITE_POS,
            complete: ToggleWriter::open(path, PURGE_COMPLETE_FLAG)?,
        })
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(MESSAGE_WRITE_POS)?;
        self.file.seek(SeekFrom::Start(MESSAGE_WRITE_POS))?;
        self.pos = MESSAGE_WRITE_POS;
        Ok(())
    }

    /// Truncate under a new session id without the counterpart's cooperation.
    fn rotate(&mut self) -> Result<()> {
        self.truncate()?;
        let session = new_session_id();
        self.file.seek(SeekFrom::Start(SESSION_ID))?;
        self.file.write_all(&session.to_le_bytes())?;
        self.complete.set(0)?;
        self.file.seek(SeekFrom::Start(MESSAGE_WRITE_POS))?;
        info!(session, "started new session");
        Ok(())
    }
}

/// Read side state for one session of the counterpart's file.
struct Session<'a> {
    tail: TailReader<'a>,
    path: PathBuf,
    session_id: i64,
    ready: ToggleWriter,
    complete: ToggleReader,
}

impl Session<'_> {
    /// Fails with `SessionChanged` if the file no longer carries our session id.
    fn check(&self) -> Result<()> {
        match read_session(&self.path) {
            Ok(id) if id == self.session_id => Ok(()),
            _ => Err(TunnelError::SessionChanged(short_name(&self.path))),
        }
    }
}

/// Buffered reader over a file that is still being appended to.
///
/// Reads block at end of file until more data arrives, the channel stops, or
/// the stall timeout passes.
struct TailReader<'a> {
    file: File,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    /// File offset just past `buf[..end]`
    file_pos: u64,
    stall_timeout: Duration,
    stop: &'a AtomicBool,
}

impl<'a> TailReader<'a> {
    fn new(file: File, position: u64, stall_timeout: Duration, stop: &'a AtomicBool) -> Self {
        TailReader {
            file,
            buf: vec![0u8; READ_AHEAD].into_boxed_slice(),
            start: 0,
            end: 0,
            file_pos: position,
            stall_timeout,
            stop,
        }
    }

    /// Offset of the next unread byte.
    fn position(&self) -> u64 {
        self.file_pos - (self.end - self.start) as u64
    }

    fn seek_to(&mut self, position: u64) {
        self.start = 0;
        self.end = 0;
        self.file_pos = position;
    }

    fn fill(&mut self) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.file_pos))?;
        let n = loop {
            match self.file.read(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.start = 0;
        self.end = n;
        self.file_pos += n as u64;
        Ok(n)
    }

    /// True when the next byte could start a command. A zero byte means the
    /// region has not been written yet; it is re-read on the next call.
    fn has_command(&mut self) -> io::Result<bool> {
        if self.start == self.end && self.fill()? == 0 {
            return Ok(false);
        }
        if self.buf[self.start] == 0 {
            let position = self.position();
            self.seek_to(position);
            return Ok(false);
        }
        Ok(true)
    }
}

impl Read for TailReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        while self.start == self.end {
            if self.fill()? > 0 {
                break;
            }
            if self.stop.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Other, "channel stopped"));
            }
            if started.elapsed() >= self.stall_timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "command still incomplete after the tunnel timeout",
                ));
            }
            thread::sleep(TAIL_POLL);
        }
        let n = out.len().min(self.end - self.start);
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.len() > 0)
}

fn new_session_id() -> i64 {
    loop {
        let id: i64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn read_session(path: &Path) -> io::Result<i64> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(SESSION_ID))?;
    let mut b = [0u8; 8];
    file.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

/// (Re)create the write file with an empty body and a fresh session id.
fn create_session_file(path: &Path) -> Result<(File, i64)> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(MESSAGE_WRITE_POS)?;
    let session = new_session_id();
    file.seek(SeekFrom::Start(SESSION_ID))?;
    file.write_all(&session.to_le_bytes())?;
    file.seek(SeekFrom::Start(MESSAGE_WRITE_POS))?;
    Ok((file, session))
}
