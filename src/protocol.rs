//! Shared protocol constants for the file tunnel

// Command tags (keep numeric stable, both ends must agree).
// Zero is never a tag: a zero byte where a tag should start means "no data yet".
pub mod tag {
    pub const CONNECT: u32 = 1;
    pub const FORWARD: u32 = 2;
    pub const PURGE: u32 = 3;
    pub const TEAR_DOWN: u32 = 4;
    pub const PING: u32 = 5;
}

// Ping kinds (one byte after the packet number)
pub mod ping_kind {
    pub const REQUEST: u8 = 1;
    pub const RESPONSE: u8 = 2;
}

// Streaming file layout:
//   0..8   session id (i64 LE), rewritten each time the writer (re)creates the file
//   8      ready-for-purge flag, raised by this side's reader for the counterpart's writer
//   9      purge-complete flag, raised by this file's writer
//   10..   command stream
pub mod layout {
    pub const SESSION_ID: u64 = 0;
    pub const READY_FOR_PURGE_FLAG: u64 = 8;
    pub const PURGE_COMPLETE_FLAG: u64 = READY_FOR_PURGE_FLAG + 1;
    pub const MESSAGE_WRITE_POS: u64 = PURGE_COMPLETE_FLAG + 1;
}

// Maximum Forward payload accepted on decode (64MB) - a larger length prefix
// means the stream is misaligned
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

// Length of the blake3 hash trailing every exchanged file
pub const CONTENT_HASH_LEN: usize = 32;

// Suffix of the temp file written before the atomic rename
pub const TEMP_SUFFIX: &str = ".tmp";

// Streaming strategy funnels every producer through a single slot
pub const STREAMING_SEND_QUEUE_CAPACITY: usize = 1;

// Exchange strategy needs some depth to batch several commands per file
pub const EXCHANGE_SEND_QUEUE_CAPACITY: usize = 32;

// Configuration defaults
pub mod defaults {
    pub const PURGE_SIZE: u64 = 10 * 1024 * 1024;
    pub const TUNNEL_TIMEOUT_MS: u64 = 5000;
    pub const READ_DURATION_MS: u64 = 50;
    pub const PACE_MS: u64 = 0;
    pub const UDP_SEND_FROM: &str = "0.0.0.0:0";
}

// Polling intervals shared by the pumps
pub mod timing {
    use std::time::Duration;

    // Toggle flag and tail polling
    pub const FLAG_POLL: Duration = Duration::from_millis(1);
    pub const TAIL_POLL: Duration = Duration::from_millis(1);

    // How often a tailing reader re-checks the session id while idle
    pub const SESSION_CHECK: Duration = Duration::from_secs(1);

    // Waiting for the streaming file to appear
    pub const FILE_APPEAR_POLL: Duration = Duration::from_millis(200);

    // Liveness
    pub const PING_INTERVAL: Duration = Duration::from_secs(1);
    pub const ONLINE_POLL: Duration = Duration::from_millis(100);

    // Pause before a pump loop is re-entered after an error
    pub const RESTART_DELAY: Duration = Duration::from_secs(1);

    // Granularity at which blocked queue operations notice shutdown
    pub const QUEUE_POLL: Duration = Duration::from_millis(100);

    // Retry/backoff bands: 1ms while under 100ms elapsed, 20ms under 1s, then 100ms
    pub const BACKOFF_FAST: Duration = Duration::from_millis(1);
    pub const BACKOFF_MEDIUM: Duration = Duration::from_millis(20);
    pub const BACKOFF_SLOW: Duration = Duration::from_millis(100);
    pub const BACKOFF_FAST_UNTIL: Duration = Duration::from_millis(100);
    pub const BACKOFF_MEDIUM_UNTIL: Duration = Duration::from_millis(1000);
}

/// Relay buffer size for a given purge size: just under half the file, at least 1MB.
pub fn relay_buffer_size(purge_size: u64) -> usize {
    let half = (purge_size as f64 / 2.0 * 0.9) as usize;
    half.max(1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_never_start_with_zero_byte() {
        for t in [tag::CONNECT, tag::FORWARD, tag::PURGE, tag::TEAR_DOWN, tag::PING] {
            assert_ne!(t.to_le_bytes()[0], 0);
        }
    }

    #[test]
    fn relay_buffer_has_floor() {
        assert_eq!(relay_buffer_size(0), 1024 * 1024);
        assert_eq!(relay_buffer_size(1024 * 1024), 1024 * 1024);
        assert_eq!(
            relay_buffer_size(defaults::PURGE_SIZE),
            (10.0 * 1024.0 * 1024.0 / 2.0 * 0.9) as usize
        );
    }
}
