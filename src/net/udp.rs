//! UDP treated as connections: one stream per remote address.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Listener, StreamHandler, ACCEPT_POLL};
use crate::protocol::timing::QUEUE_POLL;

const MAX_DATAGRAM: usize = 65_507;

enum Inbound {
    /// Datagrams demultiplexed by a server socket
    Queue(Receiver<Vec<u8>>),
    /// A socket of our own that only accepts datagrams from the peer
    Socket,
}

pub struct UdpStream {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: Arc<Inbound>,
    closed: Arc<AtomicBool>,
    pending: Vec<u8>,
    offset: usize,
}

impl UdpStream {
    /// Bind `send_from` and exchange datagrams with `target`.
    pub fn connect(send_from: &str, target: &str) -> io::Result<UdpStream> {
        let socket = UdpSocket::bind(send_from)?;
        let peer = resolve(target)?;
        socket.set_read_timeout(Some(QUEUE_POLL))?;
        Ok(UdpStream {
            socket: Arc::new(socket),
            peer,
            inbound: Arc::new(Inbound::Socket),
            closed: Arc::new(AtomicBool::new(false)),
            pending: Vec::new(),
            offset: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn try_clone(&self) -> UdpStream {
        UdpStream {
            socket: self.socket.clone(),
            peer: self.peer,
            inbound: self.inbound.clone(),
            closed: self.closed.clone(),
            pending: Vec::new(),
            offset: 0,
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_datagram(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.is_closed() {
                return Ok(None);
            }
            match self.inbound.as_ref() {
                Inbound::Queue(rx) => match rx.recv_timeout(QUEUE_POLL) {
                    Ok(d) => return Ok(Some(d)),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Ok(None),
                },
                Inbound::Socket => {
                    let mut buf = vec![0u8; MAX_DATAGRAM];
                    match self.socket.recv_from(&mut buf) {
                        Ok((n, from)) if from == self.peer => {
                            buf.truncate(n);
                            return Ok(Some(buf));
                        }
                        Ok((_, from)) => debug!("ignoring datagram from {from}"),
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

impl Read for UdpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset == self.pending.len() {
            match self.next_datagram()? {
                Some(d) => {
                    self.pending = d;
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl Write for UdpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "udp stream closed"));
        }
        for chunk in buf.chunks(MAX_DATAGRAM) {
            self.socket.send_to(chunk, self.peer)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {addr}")))
}

struct Peer {
    tx: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

struct Running {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    addr: SocketAddr,
}

/// Receives datagrams on one socket and hands each new remote address to the
/// handler as its own stream.
pub struct UdpServer {
    bind: String,
    handler: StreamHandler,
    running: Mutex<Option<Running>>,
}

impl UdpServer {
    pub fn new(bind: impl Into<String>, handler: StreamHandler) -> Self {
        UdpServer {
            bind: bind.into(),
            handler,
            running: Mutex::new(None),
        }
    }
}

impl Listener for UdpServer {
    fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind(&self.bind).with_context(|| format!("bind {}", self.bind))?;
        socket.set_read_timeout(Some(ACCEPT_POLL))?;
        let addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        info!("listening for UDP datagrams on {addr}");

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handler = self.handler.clone();
        let handle = thread::Builder::new()
            .name("udp-recv".into())
            .spawn(move || {
                let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();
                let mut buf = vec![0u8; MAX_DATAGRAM];
                while !flag.load(Ordering::Relaxed) {
                    let (n, from) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) =>
                        {
                            continue
                        }
                        Err(e) => {
                            warn!("udp receive error: {e}");
                            thread::sleep(ACCEPT_POLL);
                            continue;
                        }
                    };

                    // A closed stream is forgotten; its peer's next datagram starts a new one
                    if peers.get(&from).is_some_and(|p| p.closed.load(Ordering::SeqCst)) {
                        peers.remove(&from);
                    }
                    let peer = peers.entry(from).or_insert_with(|| {
                        info!("new UDP peer {from}");
                        let (tx, rx) = unbounded();
                        let closed = Arc::new(AtomicBool::new(false));
                        let stream = UdpStream {
                            socket: socket.clone(),
                            peer: from,
                            inbound: Arc::new(Inbound::Queue(rx)),
                            closed: closed.clone(),
                            pending: Vec::new(),
                            offset: 0,
                        };
                        handler(Box::new(stream));
                        Peer { tx, closed }
                    });
                    let _ = peer.tx.send(buf[..n].to_vec());
                }
                // Dropping the peers ends their streams
                for (_, peer) in peers {
                    peer.closed.store(true, Ordering::SeqCst);
                }
            })?;

        *running = Some(Running { stop, handle, addr });
        Ok(())
    }

    fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.stop.store(true, Ordering::Relaxed);
        let _ = running.handle.join();
        info!("stopped listening on {}", running.addr);
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn server_demultiplexes_by_peer() {
        let (tx, rx) = unbounded::<Box<dyn crate::relay::Duplex>>();
        let server = UdpServer::new(
            "127.0.0.1:0",
            Arc::new(move |s: Box<dyn crate::relay::Duplex>| {
                let _ = tx.send(s);
            }),
        );
        server.start().unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let mut a = UdpStream::connect("127.0.0.1:0", &addr).unwrap();
        let mut b = UdpStream::connect("127.0.0.1:0", &addr).unwrap();
        a.write_all(b"from a").unwrap();
        let mut stream_a = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        b.write_all(b"from b").unwrap();
        let mut stream_b = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut got = [0u8; 6];
        stream_a.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"from a");
        stream_b.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"from b");

        // Replies go back to the right peer
        stream_b.write_all(b"to b").unwrap();
        let mut reply = [0u8; 4];
        b.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"to b");

        server.stop();
    }
}
