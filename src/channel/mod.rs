//! A bidirectional channel over a pair of files.
//!
//! A channel runs four loops on their own threads: the send pump draining the
//! outbound queue into the write file, the receive pump decoding the read
//! file, the ping reporter, and the online monitor. Connections are
//! multiplexed over it by [`ConnectionId`].

mod state;
mod liveness;
mod mux;

pub use self::state::ChannelCore;
pub use self::liveness::Liveness;
pub use self::mux::Multiplexer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{error, info, info_span};

use crate::command::ConnectionId;
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::stream::TunnelStream;
use crate::transport::{self, Transport};

/// Notifications for the code driving a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The counterpart was heard from within the tunnel timeout
    Online,
    /// Nothing arrived from the counterpart for the tunnel timeout
    Offline,
    /// The counterpart opened a connection
    Connected(ConnectionId),
    /// A pump hit an unrecoverable error and stopped
    Failed(String),
}

pub struct Channel {
    core: Arc<ChannelCore>,
    transport: Arc<dyn Transport>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Channel {
    /// Channel using the transport selected by `config.mode`.
    pub fn new(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let transport = transport::build(&config);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: TunnelConfig, transport: Arc<dyn Transport>) -> Self {
        let core = Arc::new(ChannelCore::new(config, transport.send_queue_capacity()));
        Channel {
            core,
            transport,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Prepare the files and start the pumps.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.prepare()?;
        info!(
            transport = self.transport.name(),
            read = %self.core.config().read.display(),
            write = %self.core.config().write.display(),
            "channel starting"
        );

        let mut workers = self.workers.lock();

        let (core, t) = (self.core.clone(), self.transport.clone());
        workers.push(spawn_pump("send", core, move |core| {
            let _span = info_span!("send", file = %transport::short_name(&core.config().write)).entered();
            t.send_pump(core)
        })?);

        let (core, t) = (self.core.clone(), self.transport.clone());
        workers.push(spawn_pump("receive", core, move |core| {
            let _span = info_span!("receive", file = %transport::short_name(&core.config().read)).entered();
            t.receive_pump(core)
        })?);

        let core = self.core.clone();
        workers.push(spawn_named("liveness", move || {
            let _span = info_span!("liveness").entered();
            liveness::report_loop(&core);
        })?);

        let core = self.core.clone();
        workers.push(spawn_named("monitor", move || {
            let _span = info_span!("monitor").entered();
            liveness::monitor_loop(&core);
        })?);

        Ok(())
    }

    /// Channel notifications. Each event is delivered to one receiver.
    pub fn events(&self) -> Receiver<ChannelEvent> {
        self.core.events()
    }

    pub fn connect(&self, id: ConnectionId) -> Result<()> {
        self.core.connect(id)
    }

    pub fn write(&self, id: ConnectionId, data: impl Into<Vec<u8>>) -> Result<()> {
        self.core.write(id, data.into())
    }

    /// Next chunk received for `id`; `None` once the connection has ended.
    pub fn read(&self, id: ConnectionId) -> Option<Vec<u8>> {
        self.core.read(id)
    }

    pub fn tear_down(&self, id: ConnectionId) -> Result<()> {
        self.core.tear_down(id)
    }

    /// Byte stream over connection `id`, which must already be open.
    pub fn stream(&self, id: ConnectionId) -> TunnelStream {
        TunnelStream::new(self.core.clone(), id)
    }

    /// Open connection `id` and return its stream.
    pub fn open_stream(&self, id: ConnectionId) -> Result<TunnelStream> {
        self.connect(id)?;
        Ok(self.stream(id))
    }

    pub fn is_online(&self) -> bool {
        self.core.liveness().is_online()
    }

    pub fn round_trip(&self) -> Option<Duration> {
        self.core.liveness().round_trip()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.core.sent().total_bytes()
    }

    pub fn bytes_received(&self) -> u64 {
        self.core.received().total_bytes()
    }

    /// Times this side emptied its write file.
    pub fn purges(&self) -> u64 {
        self.core.purges()
    }

    pub fn open_connections(&self) -> usize {
        self.core.mux().len()
    }

    pub fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    /// Tear down every connection. The channel itself keeps running.
    pub fn stop(&self) {
        self.core.stop_connections();
    }

    /// Stop the pumps and wait for them to exit. Idempotent.
    pub fn shutdown(&self) {
        if self.core.is_stopped() {
            return;
        }
        self.core.halt();
        self.core.drop_connections();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        info!("channel stopped");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("ft-{name}"))
        .spawn(f)
        .map_err(TunnelError::Io)
}

/// Run a pump; a fatal error is logged and surfaced as `ChannelEvent::Failed`.
fn spawn_pump<F>(name: &'static str, core: Arc<ChannelCore>, pump: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(&ChannelCore) -> Result<()> + Send + 'static,
{
    spawn_named(name, move || match pump(&core) {
        Ok(()) | Err(TunnelError::Shutdown) => {}
        Err(e) => {
            error!("{name} pump failed: {e}");
            core.emit(ChannelEvent::Failed(format!("{name} pump: {e}")));
        }
    })
}
