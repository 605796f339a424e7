//! File Tunnel
//!
//! Carries TCP and UDP connections between two hosts that can only reach each
//! other through files, e.g. an SMB/NFS share or a synced folder. Each host
//! writes one file and reads the other.

pub mod app;
pub mod bandwidth;
pub mod channel;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod logger;
pub mod net;
pub mod protocol;
pub mod relay;
pub mod retry;
pub mod stream;
pub mod toggle;
pub mod transport;

pub use app::{Endpoint, Role};
pub use channel::{Channel, ChannelEvent};
pub use command::{Command, ConnectionId};
pub use config::{TransportMode, TunnelConfig};
pub use error::{Result, TunnelError};
pub use stream::TunnelStream;
