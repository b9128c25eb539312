use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::oneshot;

/// Pending single-shot continuations, at most one per key.
///
/// Each waiter remembers the subject it waits on (a generation, a serial
/// number) and a ticket so a timed-out or cancelled waiter only ever removes
/// its own entry, never a newer one registered under the same key.
pub struct WaiterTable<K> {
    next_ticket: u64,
    waiters: HashMap<K, Waiter>,
}

struct Waiter {
    ticket: u64,
    subject: u64,
    tx: oneshot::Sender<bool>,
}

impl<K: Eq + Hash + Copy> WaiterTable<K> {
    pub fn new() -> Self {
        Self {
            next_ticket: 0,
            waiters: HashMap::new(),
        }
    }

    /// Registers a waiter for `key`, resolving any previous one with `false`.
    pub fn register(&mut self, key: K, subject: u64) -> (u64, oneshot::Receiver<bool>) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.waiters.insert(key, Waiter { ticket, subject, tx }) {
            let _ = previous.tx.send(false);
        }
        (ticket, rx)
    }

    /// Resolves the waiter for `key` if it waits on `subject`.
    pub fn resolve(&mut self, key: K, subject: u64, outcome: bool) -> bool {
        if self.waiters.get(&key).map(|w| w.subject) != Some(subject) {
            return false;
        }
        match self.waiters.remove(&key) {
            Some(waiter) => {
                let _ = waiter.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolves the waiter for `key` with `false` regardless of its subject.
    pub fn cancel(&mut self, key: K) -> bool {
        match self.waiters.remove(&key) {
            Some(waiter) => {
                let _ = waiter.tx.send(false);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `key` only if it still carries `ticket`.
    pub fn withdraw(&mut self, key: K, ticket: u64) {
        if self.waiters.get(&key).map(|w| w.ticket) == Some(ticket) {
            self.waiters.remove(&key);
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.waiters.len();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.tx.send(false);
        }
        count
    }

    /// `(key, subject)` for every pending waiter.
    pub fn pending(&self) -> Vec<(K, u64)> {
        self.waiters.iter().map(|(k, w)| (*k, w.subject)).collect()
    }

    pub fn contains(&self, key: K) -> bool {
        self.waiters.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl<K: Eq + Hash + Copy> Default for WaiterTable<K> {
    fn default() -> Self {
        Self::new()
    }
}
