//! Wiring of a channel to local sockets.
//!
//! The listening side accepts local connections once the counterpart is
//! online and opens a tunnel connection for each. The forwarding side dials
//! its target whenever the counterpart opens a connection.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use crate::channel::{Channel, ChannelEvent};
use crate::command::ConnectionId;
use crate::config::TunnelConfig;
use crate::net::{Listener, StreamHandler, TcpServer, UdpServer, UdpStream};
use crate::protocol::relay_buffer_size;
use crate::protocol::timing::QUEUE_POLL;
use crate::relay::{Duplex, Relay};

/// What this end of the tunnel does with local sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accept TCP connections and carry them through the tunnel
    TcpListen { bind: String },
    /// Accept UDP datagrams, one tunnel connection per remote address
    UdpListen { bind: String },
    /// Connect to a TCP target for each tunnelled connection
    TcpForward { target: String },
    /// Send each tunnelled connection's data to a UDP target
    UdpForward { target: String, send_from: String },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::TcpListen { bind } => write!(f, "listening on tcp {bind}"),
            Role::UdpListen { bind } => write!(f, "listening on udp {bind}"),
            Role::TcpForward { target } => write!(f, "forwarding to tcp {target}"),
            Role::UdpForward { target, send_from } => {
                write!(f, "forwarding to udp {target} from {send_from}")
            }
        }
    }
}

pub struct Endpoint {
    channel: Arc<Channel>,
    listener: Option<Arc<dyn Listener>>,
    stop: Arc<AtomicBool>,
    events_thread: Mutex<Option<JoinHandle<()>>>,
    failures: Receiver<String>,
}

impl Endpoint {
    pub fn start(config: TunnelConfig, role: Role) -> Result<Endpoint> {
        let buffer = relay_buffer_size(config.purge_size);
        let read_duration = config.read_duration();
        let channel = Arc::new(Channel::new(config).context("invalid tunnel configuration")?);
        let events = channel.events();

        let listener: Option<Arc<dyn Listener>> = match &role {
            Role::TcpListen { bind } => Some(Arc::new(TcpServer::new(
                bind.clone(),
                accept_handler(Arc::downgrade(&channel), buffer, read_duration),
            ))),
            Role::UdpListen { bind } => Some(Arc::new(UdpServer::new(
                bind.clone(),
                accept_handler(Arc::downgrade(&channel), buffer, read_duration),
            ))),
            Role::TcpForward { .. } | Role::UdpForward { .. } => None,
        };

        channel.start().context("could not start channel")?;
        info!("{role}");

        let stop = Arc::new(AtomicBool::new(false));
        let (failures_tx, failures) = unbounded();
        let worker = EventLoop {
            channel: channel.clone(),
            listener: listener.clone(),
            role,
            buffer,
            read_duration,
            stop: stop.clone(),
            failures: failures_tx,
        };
        let handle = thread::Builder::new()
            .name("ft-events".into())
            .spawn(move || {
                let _span = info_span!("events").entered();
                worker.run(events);
            })?;

        Ok(Endpoint {
            channel,
            listener,
            stop,
            events_thread: Mutex::new(Some(handle)),
            failures,
        })
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Fatal errors reported by the channel or the listener.
    pub fn failures(&self) -> Receiver<String> {
        self.failures.clone()
    }

    /// Address the local listener is bound to, while it is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        self.channel.stop();
        self.channel.shutdown();
        if let Some(handle) = self.events_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens a tunnel connection for every accepted local stream.
fn accept_handler(channel: Weak<Channel>, buffer: usize, read_duration: Duration) -> StreamHandler {
    let next_id = AtomicI32::new(1);
    Arc::new(move |socket: Box<dyn Duplex>| {
        let Some(channel) = channel.upgrade() else {
            socket.close();
            return;
        };
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        match channel.open_stream(id) {
            Ok(stream) => {
                info!(connection_id = id, "{} opened", socket.describe());
                if let Err(e) = Relay::start(socket, Box::new(stream), buffer, read_duration) {
                    warn!(connection_id = id, "could not start relay: {e}");
                    let _ = channel.tear_down(id);
                }
            }
            Err(e) => {
                warn!("could not open tunnel connection: {e}");
                socket.close();
            }
        }
    })
}

struct EventLoop {
    channel: Arc<Channel>,
    listener: Option<Arc<dyn Listener>>,
    role: Role,
    buffer: usize,
    read_duration: Duration,
    stop: Arc<AtomicBool>,
    failures: Sender<String>,
}

impl EventLoop {
    fn run(self, events: Receiver<ChannelEvent>) {
        loop {
            let event = match events.recv_timeout(QUEUE_POLL) {
                Ok(e) => e,
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            debug!(?event, "channel event");

            match event {
                ChannelEvent::Online => {
                    if let Some(listener) = &self.listener {
                        if let Err(e) = listener.start() {
                            error!("could not start listener: {e:#}");
                            let _ = self.failures.send(format!("{e:#}"));
                        }
                    }
                }
                ChannelEvent::Offline => {
                    if let Some(listener) = &self.listener {
                        listener.stop();
                    }
                    self.channel.stop();
                }
                ChannelEvent::Connected(id) => self.forward(id),
                ChannelEvent::Failed(reason) => {
                    let _ = self.failures.send(reason);
                }
            }
        }
    }

    /// Dial the target for a connection the counterpart opened.
    fn forward(&self, id: ConnectionId) {
        let target = match &self.role {
            Role::TcpForward { .. } | Role::UdpForward { .. } => self.role.clone(),
            _ => {
                debug!(connection_id = id, "ignoring connection opened by counterpart");
                return;
            }
        };
        let stream = self.channel.stream(id);
        let (buffer, read_duration) = (self.buffer, self.read_duration);
        let spawned = thread::Builder::new()
            .name(format!("ft-dial-{id}"))
            .spawn(move || {
                let socket: std::io::Result<Box<dyn Duplex>> = match &target {
                    Role::TcpForward { target } => TcpStream::connect(target).map(|s| {
                        let _ = s.set_nodelay(true);
                        Box::new(s) as Box<dyn Duplex>
                    }),
                    Role::UdpForward { target, send_from } => {
                        UdpStream::connect(send_from, target).map(|s| Box::new(s) as Box<dyn Duplex>)
                    }
                    _ => return,
                };
                match socket {
                    Ok(socket) => {
                        info!(connection_id = id, "connected to {}", socket.describe());
                        if let Err(e) = Relay::start(Box::new(stream), socket, buffer, read_duration) {
                            warn!(connection_id = id, "could not start relay: {e}");
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = id, "{target} failed: {e}");
                        stream.close();
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(connection_id = id, "could not spawn dial thread: {e}");
        }
    }
}
