//! Counterpart liveness: a ping reporter measuring round trips, and a monitor
//! that turns "last heard from" timestamps into Online/Offline transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::state::ChannelCore;
use super::ChannelEvent;
use crate::command::{Command, Ping};
use crate::protocol::timing::{ONLINE_POLL, PING_INTERVAL, QUEUE_POLL};

pub struct Liveness {
    last_contact: Mutex<Option<Instant>>,
    online: AtomicBool,
    /// Packet number and write time of the outstanding ping request
    pending: Mutex<Option<(u64, Instant)>>,
    pong_tx: Sender<u64>,
    pong_rx: Receiver<u64>,
    round_trip: Mutex<Option<Duration>>,
}

impl Default for Liveness {
    fn default() -> Self {
        let (pong_tx, pong_rx) = unbounded();
        Liveness {
            last_contact: Mutex::new(None),
            online: AtomicBool::new(false),
            pending: Mutex::new(None),
            pong_tx,
            pong_rx,
            round_trip: Mutex::new(None),
        }
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Something arrived from the counterpart.
    pub fn touch(&self) {
        *self.last_contact.lock() = Some(Instant::now());
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn round_trip(&self) -> Option<Duration> {
        *self.round_trip.lock()
    }

    /// The send pump is about to write ping request `number`.
    pub(crate) fn ping_sent(&self, number: u64) {
        *self.pending.lock() = Some((number, Instant::now()));
    }

    pub(crate) fn pong_received(&self, responds_to: u64) {
        let _ = self.pong_tx.send(responds_to);
    }

    /// Recompute the online state. Returns the new state only when it changed.
    pub(crate) fn evaluate(&self, now: Instant, timeout: Duration) -> Option<bool> {
        let online = match *self.last_contact.lock() {
            Some(at) => now.saturating_duration_since(at) < timeout,
            None => false,
        };
        let was = self.online.swap(online, Ordering::Relaxed);
        (was != online).then_some(online)
    }

    /// Send one ping and wait for its response.
    fn probe(&self, core: &ChannelCore, timeout: Duration) -> Option<Duration> {
        while self.pong_rx.try_recv().is_ok() {}
        *self.pending.lock() = None;

        if let Err(e) = core.enqueue_within(Command::Ping(Ping::Request), timeout) {
            debug!("could not queue ping: {e}");
            return None;
        }

        let started = Instant::now();
        loop {
            let remaining = timeout.checked_sub(started.elapsed())?;
            match self.pong_rx.recv_timeout(remaining.min(QUEUE_POLL)) {
                Ok(responds_to) => {
                    if let Some((number, sent_at)) = *self.pending.lock() {
                        if number == responds_to {
                            return Some(sent_at.elapsed());
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if core.is_stopped() {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// Ping the counterpart once a second and log a status line.
pub(crate) fn report_loop(core: &ChannelCore) {
    let timeout = core.config().tunnel_timeout();
    loop {
        let rtt = core.liveness().probe(core, timeout);
        if rtt.is_some() {
            *core.liveness().round_trip.lock() = rtt;
        }

        let state = if core.liveness().is_online() {
            "Online"
        } else {
            "Offline"
        };
        let rtt = rtt.map_or_else(|| "-".to_string(), |d| format!("{:.1}ms", d.as_secs_f64() * 1000.0));
        info!(
            "Counterpart: {state:<8} Rx: {:<12} Tx: {:<12} RTT: {rtt}",
            core.received().describe(),
            core.sent().describe(),
        );

        if !core.pause(PING_INTERVAL) {
            break;
        }
    }
}

/// Emit Online/Offline whenever the counterpart's state flips.
pub(crate) fn monitor_loop(core: &ChannelCore) {
    let timeout = core.config().tunnel_timeout();
    loop {
        match core.liveness().evaluate(Instant::now(), timeout) {
            Some(true) => {
                info!("counterpart is online");
                core.emit(ChannelEvent::Online);
            }
            Some(false) => {
                warn!("counterpart went offline");
                core.emit(ChannelEvent::Offline);
            }
            None => {}
        }
        if !core.pause(ONLINE_POLL) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_fire_once() {
        let l = Liveness::new();
        let timeout = Duration::from_millis(500);
        let now = Instant::now();

        // Never heard from: offline, no transition
        assert_eq!(l.evaluate(now, timeout), None);

        l.touch();
        let t0 = Instant::now();
        assert_eq!(l.evaluate(t0, timeout), Some(true));
        assert_eq!(l.evaluate(t0 + Duration::from_millis(100), timeout), None);
        assert!(l.is_online());

        assert_eq!(l.evaluate(t0 + Duration::from_secs(1), timeout), Some(false));
        assert_eq!(l.evaluate(t0 + Duration::from_secs(2), timeout), None);
        assert!(!l.is_online());
    }

    #[test]
    fn contact_brings_it_back() {
        let l = Liveness::new();
        let timeout = Duration::from_millis(200);
        l.touch();
        let t0 = Instant::now();
        assert_eq!(l.evaluate(t0, timeout), Some(true));
        assert_eq!(l.evaluate(t0 + Duration::from_secs(1), timeout), Some(false));

        l.touch();
        assert_eq!(l.evaluate(Instant::now(), timeout), Some(true));
    }
}
