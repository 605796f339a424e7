//! Connection id -> inbound byte queue.
//!
//! Completing a queue drops its sender: readers drain whatever is buffered and
//! then see end-of-stream. A completed queue that still holds data stays
//! reachable through `receiver` until it has been read empty.

use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::command::ConnectionId;

struct ConnectionQueue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

#[derive(Default)]
struct Queues {
    open: HashMap<ConnectionId, ConnectionQueue>,
    // Completed, sender gone, data not read yet
    draining: HashMap<ConnectionId, Receiver<Vec<u8>>>,
}

impl Queues {
    fn retire(&mut self, id: ConnectionId, queue: ConnectionQueue) {
        drop(queue.tx);
        self.draining.retain(|_, rx| !rx.is_empty());
        if !queue.rx.is_empty() {
            self.draining.insert(id, queue.rx);
        }
    }
}

#[derive(Default)]
pub struct Multiplexer {
    queues: Mutex<Queues>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue for `id`. Returns false if it already existed.
    pub fn open(&self, id: ConnectionId) -> bool {
        let mut queues = self.queues.lock();
        if queues.open.contains_key(&id) {
            return false;
        }
        // A reused id starts from an empty queue
        queues.draining.remove(&id);
        let (tx, rx) = unbounded();
        queues.open.insert(id, ConnectionQueue { tx, rx });
        true
    }

    /// Queue inbound data. Returns false when no such connection is open.
    pub fn deliver(&self, id: ConnectionId, payload: Vec<u8>) -> bool {
        match self.queues.lock().open.get(&id) {
            Some(q) => q.tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// End the stream; buffered data stays readable until drained.
    pub fn complete(&self, id: ConnectionId) -> bool {
        let mut queues = self.queues.lock();
        match queues.open.remove(&id) {
            Some(queue) => {
                queues.retire(id, queue);
                true
            }
            None => false,
        }
    }

    pub fn complete_all(&self) -> Vec<ConnectionId> {
        let mut queues = self.queues.lock();
        let open: Vec<_> = queues.open.drain().collect();
        let ids = open.iter().map(|(id, _)| *id).collect();
        for (id, queue) in open {
            queues.retire(id, queue);
        }
        ids
    }

    /// Receiving end for `id`, open or still draining.
    pub fn receiver(&self, id: ConnectionId) -> Option<Receiver<Vec<u8>>> {
        let queues = self.queues.lock();
        match queues.open.get(&id) {
            Some(q) => Some(q.rx.clone()),
            None => queues.draining.get(&id).cloned(),
        }
    }

    /// Forget a drained queue once its reader has seen end-of-stream.
    pub fn release(&self, id: ConnectionId) {
        self.queues.lock().draining.remove(&id);
    }

    /// True while `id` is open; a draining queue does not count.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.queues.lock().open.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.queues.lock().open.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.queues.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
