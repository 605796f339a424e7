//! Bidirectional copy between two byte streams.
//!
//! One thread per direction. When either direction ends or fails both
//! streams are closed, which unblocks the other direction.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::net::udp::UdpStream;
use crate::stream::TunnelStream;

/// A full-duplex stream that can be split into independent handles.
pub trait Duplex: Read + Write + Send {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>>;

    /// Close both directions. Must unblock a concurrent `read`.
    fn close(&self);

    fn describe(&self) -> String;

    /// Bound how long `read` may wait. Streams that keep message boundaries
    /// leave this unsupported and are relayed one read at a time.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let _ = timeout;
        Err(io::ErrorKind::Unsupported.into())
    }
}

impl Duplex for TcpStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn close(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }

    fn describe(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => format!("tcp {addr}"),
            Err(_) => "tcp (disconnected)".to_string(),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl Duplex for TunnelStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()))
    }

    fn close(&self) {
        TunnelStream::close(self);
    }

    fn describe(&self) -> String {
        format!("tunnel connection {}", self.id())
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TunnelStream::set_read_timeout(self, timeout);
        Ok(())
    }
}

impl Duplex for UdpStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()))
    }

    fn close(&self) {
        UdpStream::close(self);
    }

    fn describe(&self) -> String {
        format!("udp {}", self.peer())
    }
}

struct Closer {
    a: Mutex<Box<dyn Duplex>>,
    b: Mutex<Box<dyn Duplex>>,
    closed: AtomicBool,
}

impl Closer {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.a.lock().close();
            self.b.lock().close();
        }
    }
}

pub struct Relay {
    handles: Vec<JoinHandle<u64>>,
}

impl Relay {
    /// Start copying `a` <-> `b` with a buffer of `buffer_size` per direction.
    ///
    /// After each read the copier keeps reading for up to `read_duration`, or
    /// until the buffer is full, before writing. Zero writes every read as is.
    pub fn start(
        a: Box<dyn Duplex>,
        b: Box<dyn Duplex>,
        buffer_size: usize,
        read_duration: Duration,
    ) -> io::Result<Relay> {
        let label = format!("{} <-> {}", a.describe(), b.describe());
        let closer = Arc::new(Closer {
            a: Mutex::new(a.try_clone_duplex()?),
            b: Mutex::new(b.try_clone_duplex()?),
            closed: AtomicBool::new(false),
        });
        let a_write = a.try_clone_duplex()?;
        let b_write = b.try_clone_duplex()?;
        debug!("relay started: {label}");

        let batching = Batching {
            buffer_size,
            read_duration,
        };
        let forward = spawn_direction("relay-fwd", a, b_write, batching, closer.clone())?;
        let backward = spawn_direction("relay-back", b, a_write, batching, closer)?;
        Ok(Relay {
            handles: vec![forward, backward],
        })
    }

    /// Wait for both directions. Returns bytes copied (a->b, b->a).
    pub fn join(self) -> (u64, u64) {
        let mut totals = self.handles.into_iter().map(|h| h.join().unwrap_or(0));
        let forward = totals.next().unwrap_or(0);
        let backward = totals.next().unwrap_or(0);
        (forward, backward)
    }
}

#[derive(Clone, Copy)]
struct Batching {
    buffer_size: usize,
    read_duration: Duration,
}

fn spawn_direction(
    name: &str,
    mut from: Box<dyn Duplex>,
    mut to: Box<dyn Duplex>,
    batching: Batching,
    closer: Arc<Closer>,
) -> io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buf = vec![0u8; batching.buffer_size.max(1)];
            let outcome = copy(from.as_mut(), to.as_mut(), &mut buf, batching.read_duration);
            let copied = match outcome {
                Ok(n) => n,
                Err((n, e)) => {
                    debug!("{} -> {}: {e}", from.describe(), to.describe());
                    n
                }
            };
            closer.close();
            copied
        })
}

fn copy(
    from: &mut dyn Duplex,
    to: &mut dyn Duplex,
    buf: &mut [u8],
    read_duration: Duration,
) -> Result<u64, (u64, io::Error)> {
    let batching = !read_duration.is_zero() && from.set_read_timeout(None).is_ok();
    let mut total = 0u64;
    loop {
        let mut filled = match from.read(buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err((total, e)),
        };
        let mut ended = false;
        if batching {
            let deadline = Instant::now() + read_duration;
            ended = fill_until(from, buf, &mut filled, deadline).map_err(|e| (total, e))?;
            from.set_read_timeout(None).map_err(|e| (total, e))?;
        }
        to.write_all(&buf[..filled])
            .and_then(|()| to.flush())
            .map_err(|e| (total, e))?;
        total += filled as u64;
        if ended {
            return Ok(total);
        }
    }
}

/// Read more into `buf[*filled..]` until it is full or `deadline` passes.
/// Returns true if the stream ended meanwhile.
fn fill_until(
    from: &mut dyn Duplex,
    buf: &mut [u8],
    filled: &mut usize,
    deadline: Instant,
) -> io::Result<bool> {
    while *filled < buf.len() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        from.set_read_timeout(Some(left))?;
        match from.read(&mut buf[*filled..]) {
            Ok(0) => return Ok(true),
            Ok(n) => *filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelCore;
    use crate::command::Command;
    use crate::config::TunnelConfig;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn copies_both_ways_and_closes_on_eof() {
        let (mut left, left_inner) = pair();
        let (right_inner, mut right) = pair();

        let relay = Relay::start(
            Box::new(left_inner),
            Box::new(right_inner),
            4096,
            Duration::ZERO,
        )
        .unwrap();

        left.write_all(b"ping").unwrap();
        let mut got = [0u8; 4];
        right.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        right.write_all(b"pong").unwrap();
        left.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"pong");

        // Closing one side ends the other
        left.shutdown(Shutdown::Both).unwrap();
        let mut rest = Vec::new();
        right.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        let (forward, backward) = relay.join();
        assert_eq!(forward, 4);
        assert_eq!(backward, 4);
    }

    #[test]
    fn small_writes_within_read_duration_are_batched() {
        let (mut left, left_inner) = pair();
        let core = Arc::new(ChannelCore::new(TunnelConfig::new("a", "b"), 8));
        core.mux().open(1);
        let tunnel = TunnelStream::new(core.clone(), 1);

        let relay = Relay::start(
            Box::new(left_inner),
            Box::new(tunnel),
            4096,
            Duration::from_millis(300),
        )
        .unwrap();

        left.write_all(b"a").unwrap();
        thread::sleep(Duration::from_millis(20));
        left.write_all(b"b").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let first = loop {
            if let Some(command) = core.try_next_outgoing() {
                break command;
            }
            assert!(Instant::now() < deadline, "nothing relayed");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(
            first,
            Command::Forward {
                connection_id: 1,
                payload: b"ab".to_vec()
            }
        );

        left.shutdown(Shutdown::Both).unwrap();
        let (forward, _) = relay.join();
        assert_eq!(forward, 2);
    }
}
