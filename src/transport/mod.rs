//! File disciplines that move encoded commands between the two ends.

mod access;
mod exchange;
mod streaming;

pub use access::{FileAccess, LocalAccess, PacedAccess};
pub use exchange::ExchangeTransport;
pub use streaming::StreamingTransport;

use std::path::Path;
use std::sync::Arc;

use crate::channel::ChannelCore;
use crate::config::{TransportMode, TunnelConfig};
use crate::error::Result;

/// A way of carrying commands through the shared files.
///
/// The send pump drains the core's outbound queue; the receive pump hands
/// decoded packets to [`ChannelCore::dispatch`]. Both return `Ok(())` once the
/// core is halted and `Err` only for failures the channel cannot recover from.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn send_queue_capacity(&self) -> usize;

    /// Create or clean up files before the pumps start.
    fn prepare(&self) -> Result<()>;

    fn send_pump(&self, core: &ChannelCore) -> Result<()>;

    fn receive_pump(&self, core: &ChannelCore) -> Result<()>;
}

pub fn build(config: &TunnelConfig) -> Arc<dyn Transport> {
    match config.mode {
        TransportMode::Streaming => Arc::new(StreamingTransport::new(config)),
        TransportMode::Exchange => {
            let access: Arc<dyn FileAccess> = if config.pace_ms > 0 {
                Arc::new(PacedAccess::new(LocalAccess, config.pace()))
            } else {
                Arc::new(LocalAccess)
            };
            Arc::new(ExchangeTransport::new(config, access))
        }
    }
}

/// File name for log lines
pub fn short_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
