use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::{Listener, StreamHandler, ACCEPT_POLL};

struct Running {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    addr: SocketAddr,
}

pub struct TcpServer {
    bind: String,
    handler: StreamHandler,
    running: Mutex<Option<Running>>,
}

impl TcpServer {
    pub fn new(bind: impl Into<String>, handler: StreamHandler) -> Self {
        TcpServer {
            bind: bind.into(),
            handler,
            running: Mutex::new(None),
        }
    }
}

impl Listener for TcpServer {
    fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let listener =
            TcpListener::bind(&self.bind).with_context(|| format!("bind {}", self.bind))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        info!("listening for TCP connections on {addr}");

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handler = self.handler.clone();
        let handle = thread::Builder::new()
            .name("tcp-accept".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            // Accepted sockets inherit non-blocking mode on some platforms
                            if let Err(e) = stream.set_nonblocking(false) {
                                warn!("dropping connection from {peer}: {e}");
                                continue;
                            }
                            let _ = stream.set_nodelay(true);
                            info!("accepted connection from {peer}");
                            handler(Box::new(stream));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
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
    use crossbeam_channel::unbounded;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn accepts_and_restarts() {
        let (tx, rx) = unbounded();
        let server = TcpServer::new(
            "127.0.0.1:0",
            Arc::new(move |mut s: Box<dyn crate::relay::Duplex>| {
                let mut b = [0u8; 2];
                s.read_exact(&mut b).unwrap();
                tx.send(b).unwrap();
            }),
        );

        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        TcpStream::connect(addr).unwrap().write_all(b"hi").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), *b"hi");

        server.stop();
        assert!(!server.is_running());
        server.start().unwrap();
        assert!(server.is_running());
        server.stop();
    }
}
