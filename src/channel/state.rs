//! State shared by a channel's pumps, its streams and its public handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::liveness::Liveness;
use super::mux::Multiplexer;
use super::ChannelEvent;
use crate::bandwidth::BandwidthTracker;
use crate::command::{Command, ConnectionId, Packet, PacketCounter, Ping};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::timing::QUEUE_POLL;
use crate::protocol::MAX_PAYLOAD_SIZE;

pub struct ChannelCore {
    config: TunnelConfig,
    send_tx: Sender<Command>,
    send_rx: Receiver<Command>,
    counter: PacketCounter,
    mux: Multiplexer,
    liveness: Liveness,
    sent: BandwidthTracker,
    received: BandwidthTracker,
    purges: AtomicU64,
    events_tx: Sender<ChannelEvent>,
    events_rx: Receiver<ChannelEvent>,
    stopped: AtomicBool,
    // Dropping the sender wakes every `pause` at once
    stop_signal: Mutex<Option<Sender<()>>>,
    stop_wait: Receiver<()>,
}

impl ChannelCore {
    pub fn new(config: TunnelConfig, send_queue_capacity: usize) -> Self {
        let (send_tx, send_rx) = bounded(send_queue_capacity.max(1));
        let (events_tx, events_rx) = unbounded();
        let (stop_tx, stop_wait) = bounded(1);
        ChannelCore {
            config,
            send_tx,
            send_rx,
            counter: PacketCounter::new(),
            mux: Multiplexer::new(),
            liveness: Liveness::new(),
            sent: BandwidthTracker::new(100, Duration::from_secs(1)),
            received: BandwidthTracker::new(100, Duration::from_secs(1)),
            purges: AtomicU64::new(0),
            events_tx,
            events_rx,
            stopped: AtomicBool::new(false),
            stop_signal: Mutex::new(Some(stop_tx)),
            stop_wait,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn sent(&self) -> &BandwidthTracker {
        &self.sent
    }

    pub fn received(&self) -> &BandwidthTracker {
        &self.received
    }

    /// Times the write file was emptied, by handshake or by rotation.
    pub fn purges(&self) -> u64 {
        self.purges.load(Ordering::Relaxed)
    }

    pub(crate) fn record_purge(&self) {
        self.purges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events(&self) -> Receiver<ChannelEvent> {
        self.events_rx.clone()
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stopped
    }

    /// Raise the stop flag and wake every sleeping loop.
    pub(crate) fn halt(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.stop_signal.lock().take();
    }

    /// Sleep for `d`. Returns false if the channel was halted meanwhile.
    pub fn pause(&self, d: Duration) -> bool {
        match self.stop_wait.recv_timeout(d) {
            Err(RecvTimeoutError::Timeout) => !self.is_stopped(),
            _ => false,
        }
    }

    // ===== outgoing =====

    /// Queue a command, blocking while the queue is full.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        self.enqueue_until(command, None)
    }

    /// Queue a command, giving up after `timeout`.
    pub fn enqueue_within(&self, command: Command, timeout: Duration) -> Result<()> {
        self.enqueue_until(command, Some(timeout))
    }

    fn enqueue_until(&self, mut command: Command, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.is_stopped() {
                return Err(TunnelError::Shutdown);
            }
            let wait = match timeout {
                Some(limit) => match limit.checked_sub(started.elapsed()) {
                    Some(left) => left.min(QUEUE_POLL),
                    None => {
                        return Err(TunnelError::timeout(
                            format!("Queueing {}", command.name()),
                            limit,
                        ))
                    }
                },
                None => QUEUE_POLL,
            };
            match self.send_tx.send_timeout(command, wait) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(c)) => command = c,
                Err(SendTimeoutError::Disconnected(_)) => return Err(TunnelError::Shutdown),
            }
        }
    }

    /// Queue without waiting. Returns false if the queue was full.
    pub fn offer(&self, command: Command) -> bool {
        self.send_tx.try_send(command).is_ok()
    }

    /// Next command for the send pump. `None` once the channel is halted.
    pub fn next_outgoing(&self) -> Option<Command> {
        loop {
            if self.is_stopped() {
                return None;
            }
            match self.send_rx.recv_timeout(QUEUE_POLL) {
                Ok(c) => return Some(c),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub fn try_next_outgoing(&self) -> Option<Command> {
        self.send_rx.try_recv().ok()
    }

    /// Assign the packet number `command` goes out with. Call immediately
    /// before encoding, in wire order.
    pub fn stamp(&self, command: &Command) -> u64 {
        let number = self.counter.next();
        if let Command::Ping(Ping::Request) = command {
            self.liveness.ping_sent(number);
        }
        number
    }

    /// Bookkeeping once `command` has been written.
    pub fn record_sent(&self, command: &Command) {
        if let Command::Forward { payload, .. } = command {
            self.sent.add(payload.len() as u64);
        }
    }

    // ===== incoming =====

    /// Route one received command.
    pub fn dispatch(&self, packet: Packet) {
        self.liveness.touch();
        match packet.command {
            Command::Forward {
                connection_id,
                payload,
            } => {
                let len = payload.len() as u64;
                if self.mux.deliver(connection_id, payload) {
                    self.received.add(len);
                } else {
                    trace!(connection_id, "dropping data for unknown connection");
                }
            }
            Command::Connect { connection_id } => {
                if self.mux.open(connection_id) {
                    debug!(connection_id, "counterpart opened connection");
                    self.emit(ChannelEvent::Connected(connection_id));
                }
            }
            Command::TearDown { connection_id } => {
                if self.mux.complete(connection_id) {
                    info!(connection_id, "counterpart asked to tear down connection");
                }
            }
            Command::Ping(Ping::Request) => {
                // Never block here: the send pump may itself be waiting on us
                let pong = Command::Ping(Ping::Response {
                    responds_to: packet.number,
                });
                if !self.offer(pong) {
                    trace!(packet = packet.number, "send queue full, ping response dropped");
                }
            }
            Command::Ping(Ping::Response { responds_to }) => {
                self.liveness.pong_received(responds_to);
            }
            Command::Purge => debug!("ignoring purge outside a streaming file"),
        }
    }

    // ===== connections =====

    pub fn connect(&self, id: ConnectionId) -> Result<()> {
        self.mux.open(id);
        self.enqueue(Command::Connect { connection_id: id })
    }

    /// Queue `data` as one or more Forward commands, none larger than the
    /// counterpart accepts.
    pub fn write(&self, id: ConnectionId, data: Vec<u8>) -> Result<()> {
        self.write_chunked(id, data, MAX_PAYLOAD_SIZE)
    }

    fn write_chunked(&self, id: ConnectionId, data: Vec<u8>, limit: usize) -> Result<()> {
        if data.len() <= limit {
            return self.enqueue(Command::Forward {
                connection_id: id,
                payload: data,
            });
        }
        for chunk in data.chunks(limit) {
            self.enqueue(Command::Forward {
                connection_id: id,
                payload: chunk.to_vec(),
            })?;
        }
        Ok(())
    }

    /// Tell the counterpart to close `id` and end the local stream.
    pub fn tear_down(&self, id: ConnectionId) -> Result<()> {
        let sent = self.enqueue_within(
            Command::TearDown { connection_id: id },
            self.config.tunnel_timeout(),
        );
        self.mux.complete(id);
        sent
    }

    /// Next chunk for `id`, blocking. `None` at end of stream, after every
    /// chunk that arrived before the teardown has been returned.
    pub fn read(&self, id: ConnectionId) -> Option<Vec<u8>> {
        let rx = self.mux.receiver(id)?;
        match rx.recv() {
            Ok(chunk) => Some(chunk),
            Err(_) => {
                self.mux.release(id);
                None
            }
        }
    }

    /// Tear down every open connection.
    pub fn stop_connections(&self) {
        for id in self.mux.ids() {
            if let Err(e) = self.tear_down(id) {
                warn!(connection_id = id, "could not notify counterpart of teardown: {e}");
            }
        }
    }

    /// End every local stream without notifying the counterpart.
    pub(crate) fn drop_connections(&self) {
        let ids = self.mux.complete_all();
        if !ids.is_empty() {
            debug!(count = ids.len(), "closed local streams");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(capacity: usize) -> ChannelCore {
        ChannelCore::new(TunnelConfig::new("a.dat", "b.dat"), capacity)
    }

    #[test]
    fn ping_request_is_answered_with_its_packet_number() {
        let core = core(4);
        core.dispatch(Packet {
            number: 77,
            command: Command::Ping(Ping::Request),
        });
        assert_eq!(
            core.try_next_outgoing(),
            Some(Command::Ping(Ping::Response { responds_to: 77 }))
        );
    }

    #[test]
    fn ping_response_is_dropped_when_queue_full() {
        let core = core(1);
        core.enqueue(Command::Purge).unwrap();
        core.dispatch(Packet {
            number: 1,
            command: Command::Ping(Ping::Request),
        });
        assert_eq!(core.try_next_outgoing(), Some(Command::Purge));
        assert_eq!(core.try_next_outgoing(), None);
    }

    #[test]
    fn connect_from_counterpart_emits_event_once() {
        let core = core(4);
        let events = core.events();
        for _ in 0..2 {
            core.dispatch(Packet {
                number: 0,
                command: Command::Connect { connection_id: 9 },
            });
        }
        assert!(matches!(events.try_recv(), Ok(ChannelEvent::Connected(9))));
        assert!(events.try_recv().is_err());
        assert!(core.mux().contains(9));
    }

    #[test]
    fn forward_for_unknown_connection_is_dropped() {
        let core = core(4);
        core.dispatch(Packet {
            number: 0,
            command: Command::Forward {
                connection_id: 3,
                payload: vec![1, 2, 3],
            },
        });
        assert!(!core.mux().contains(3));
        assert_eq!(core.received().total_bytes(), 0);
    }

    #[test]
    fn teardown_ends_stream_after_buffered_data() {
        let core = core(4);
        core.mux().open(2);
        core.dispatch(Packet {
            number: 0,
            command: Command::Forward {
                connection_id: 2,
                payload: b"bye".to_vec(),
            },
        });
        let rx = core.mux().receiver(2).unwrap();
        core.dispatch(Packet {
            number: 1,
            command: Command::TearDown { connection_id: 2 },
        });
        assert_eq!(rx.recv().unwrap(), b"bye".to_vec());
        assert!(rx.recv().is_err());
        assert!(core.read(2).is_none());
    }

    #[test]
    fn read_returns_data_that_arrived_before_teardown() {
        let core = core(4);
        core.mux().open(4);
        for (number, chunk) in [&b"first-"[..], b"second"].into_iter().enumerate() {
            core.dispatch(Packet {
                number: number as u64,
                command: Command::Forward {
                    connection_id: 4,
                    payload: chunk.to_vec(),
                },
            });
        }
        core.dispatch(Packet {
            number: 2,
            command: Command::TearDown { connection_id: 4 },
        });

        assert_eq!(core.read(4), Some(b"first-".to_vec()));
        assert_eq!(core.read(4), Some(b"second".to_vec()));
        assert_eq!(core.read(4), None);
        assert_eq!(core.read(4), None);
    }

    #[test]
    fn large_writes_are_split() {
        let core = core(8);
        core.write_chunked(5, (0..10u8).collect(), 4).unwrap();
        let mut payloads = Vec::new();
        while let Some(Command::Forward { payload, .. }) = core.try_next_outgoing() {
            payloads.push(payload);
        }
        assert_eq!(payloads, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn write_at_the_limit_is_one_command() {
        let core = core(2);
        core.write_chunked(5, vec![7; 4], 4).unwrap();
        match core.try_next_outgoing() {
            Some(Command::Forward { payload, .. }) => assert_eq!(payload.len(), 4),
            other => panic!("expected one forward, got {other:?}"),
        }
        assert_eq!(core.try_next_outgoing(), None);
    }

    #[test]
    fn enqueue_within_times_out_on_full_queue() {
        let core = core(1);
        core.enqueue(Command::Purge).unwrap();
        let err = core
            .enqueue_within(Command::Purge, Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn halt_wakes_pause_and_rejects_enqueue() {
        let core = core(1);
        core.halt();
        assert!(!core.pause(Duration::from_secs(10)));
        assert!(matches!(
            core.enqueue(Command::Purge),
            Err(TunnelError::Shutdown)
        ));
        assert!(core.next_outgoing().is_none());
    }
}
