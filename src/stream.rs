//! `Read`/`Write` view of one tunnelled connection.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::channel::ChannelCore;
use crate::command::ConnectionId;
use crate::error::TunnelError;

pub struct TunnelStream {
    core: Arc<ChannelCore>,
    id: ConnectionId,
    // Taken when the stream is created so a teardown cannot strand buffered data
    inbound: Option<Receiver<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    read_timeout: Option<Duration>,
    closed: Arc<AtomicBool>,
}

impl TunnelStream {
    pub(crate) fn new(core: Arc<ChannelCore>, id: ConnectionId) -> Self {
        let inbound = core.mux().receiver(id);
        TunnelStream {
            core,
            id,
            inbound,
            pending: Vec::new(),
            offset: 0,
            read_timeout: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Another handle on the same connection, sharing its closed state.
    pub fn try_clone(&self) -> TunnelStream {
        TunnelStream {
            core: self.core.clone(),
            id: self.id,
            inbound: self.inbound.clone(),
            pending: Vec::new(),
            offset: 0,
            read_timeout: None,
            closed: self.closed.clone(),
        }
    }

    /// `None` blocks until data arrives. Otherwise a read with nothing
    /// buffered fails with `TimedOut` after `timeout`.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Tear the connection down. Only the first call has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.core.tear_down(self.id) {
            debug!(connection_id = self.id, "teardown not sent: {e}");
        }
    }

    fn next_chunk(&self) -> io::Result<Option<Vec<u8>>> {
        let Some(rx) = &self.inbound else {
            return Ok(None);
        };
        match self.read_timeout {
            None => Ok(rx.recv().ok()),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(chunk) => Ok(Some(chunk)),
                Err(RecvTimeoutError::Disconnected) => Ok(None),
                Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("nothing received on connection {}", self.id),
                )),
            },
        }
    }
}

impl Read for TunnelStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset == self.pending.len() {
            match self.next_chunk()? {
                Some(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                None => {
                    self.core.mux().release(self.id);
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl Write for TunnelStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) || !self.core.mux().contains(self.id) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("connection {} is closed", self.id),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.core.write(self.id, buf.to_vec()).map_err(|e| match e {
            TunnelError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::BrokenPipe, other.to_string()),
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
