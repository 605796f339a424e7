//! Error types for the tunnel.

use std::io;
use std::time::Duration;

/// Errors produced by the file tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unrecognised command tag {0}")]
    UnknownCommand(u32),

    #[error("malformed {command} command: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },

    #[error("{operation} has exceeded the tunnel timeout of {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u128 },

    #[error("new session detected in {0}")]
    SessionChanged(String),

    #[error("content hash mismatch in {0}")]
    HashMismatch(String),

    #[error("channel is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        TunnelError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis(),
        }
    }

    /// Corruption of the command stream. Parsing cannot continue past it.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TunnelError::UnknownCommand(_) | TunnelError::Malformed { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TunnelError::Timeout { .. })
    }
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_protocol_violations() {
        assert!(TunnelError::UnknownCommand(99).is_protocol_violation());
        assert!(TunnelError::Malformed {
            command: "Forward",
            reason: "negative length".into()
        }
        .is_protocol_violation());
        assert!(!TunnelError::Shutdown.is_protocol_violation());
        assert!(!TunnelError::SessionChanged("a.dat".into()).is_protocol_violation());
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = TunnelError::timeout("Wait for file", Duration::from_millis(5000));
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Wait for file has exceeded the tunnel timeout of 5000 ms"
        );
    }
}
