//! Local socket endpoints feeding connections into the tunnel.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::relay::Duplex;

pub use tcp::TcpServer;
pub use udp::{UdpServer, UdpStream};

/// Called with every accepted connection.
pub type StreamHandler = Arc<dyn Fn(Box<dyn Duplex>) + Send + Sync>;

/// How often accept loops notice a stop request
pub(crate) const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A listener that can be started and stopped repeatedly as the counterpart
/// comes and goes.
pub trait Listener: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// Bound address while running
    fn local_addr(&self) -> Option<SocketAddr>;
}
