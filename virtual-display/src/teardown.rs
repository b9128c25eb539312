//! Waiting for the OS to let go of a virtual display.
//!
//! Two signals are involved. The termination callback says a specific device
//! generation is gone; the online-device query says whether any display with
//! the managed identity is still visible. The second is observed through
//! reconfiguration notifications when they are available, or by polling.

use std::hash::Hash;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::coordinator::{Inner, State};
use crate::record::ConfigId;
use crate::waiter::WaiterTable;

/// How offline confirmation is observed, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineMode {
    /// Re-check on every reconfiguration notification.
    Push,
    /// Re-check at a fixed interval.
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TeardownWait {
    Confirmed,
    TimedOut,
    /// Superseded by a newer waiter or cancelled by shutdown.
    Cancelled,
}

/// Removes a waiter entry on timeout or when the waiting future is dropped.
struct Withdraw<'a, K: Eq + Hash + Copy> {
    inner: &'a Inner,
    table: fn(&mut State) -> &mut WaiterTable<K>,
    key: K,
    ticket: u64,
}

impl<K: Eq + Hash + Copy> Drop for Withdraw<'_, K> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        (self.table)(&mut state).withdraw(self.key, self.ticket);
    }
}

fn terminations(state: &mut State) -> &mut WaiterTable<ConfigId> {
    &mut state.terminations
}

fn offline(state: &mut State) -> &mut WaiterTable<u64> {
    &mut state.offline
}

impl Inner {
    pub(crate) async fn await_termination(
        &self,
        id: ConfigId,
        generation: u64,
        timeout: Duration,
    ) -> TeardownWait {
        let (ticket, rx) = {
            let mut state = self.lock();
            if state.registry.generation(id) != Some(generation) {
                return TeardownWait::Confirmed;
            }
            state.terminations.register(id, generation)
        };
        let _withdraw = Withdraw {
            inner: self,
            table: terminations,
            key: id,
            ticket,
        };

        match time::timeout(timeout, rx).await {
            Ok(Ok(true)) => TeardownWait::Confirmed,
            Ok(Ok(false)) | Ok(Err(_)) => {
                log::debug!("Termination wait for {} generation {} cancelled", id, generation);
                TeardownWait::Cancelled
            }
            Err(_) => {
                log::warn!(
                    "Timed out after {:?} waiting for {} generation {} to terminate",
                    timeout,
                    id,
                    generation
                );
                TeardownWait::TimedOut
            }
        }
    }

    fn is_online(&self, serial_number: u32) -> bool {
        self.platform
            .inspector
            .is_display_online(self.identity(serial_number))
    }

    pub(crate) async fn wait_for_offline(&self, serial_number: u32, timeout: Duration) -> bool {
        if !self.is_online(serial_number) {
            return true;
        }
        log::debug!(
            "Waiting up to {:?} for serial {} to go offline ({:?})",
            timeout,
            serial_number,
            self.offline_mode
        );
        match self.offline_mode {
            OfflineMode::Push => self.wait_offline_push(serial_number, timeout).await,
            OfflineMode::Poll => self.wait_offline_poll(serial_number, timeout).await,
        }
    }

    async fn wait_offline_push(&self, serial_number: u32, timeout: Duration) -> bool {
        let (key, ticket, rx) = {
            let mut state = self.lock();
            let key = state.next_offline_key();
            let (ticket, rx) = state.offline.register(key, serial_number as u64);
            (key, ticket, rx)
        };
        let _withdraw = Withdraw {
            inner: self,
            table: offline,
            key,
            ticket,
        };
        // A notification that landed before the registration found no waiter.
        if !self.is_online(serial_number) {
            return true;
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => false,
            // The last notification may have been missed; ask once more.
            Err(_) => !self.is_online(serial_number),
        }
    }

    async fn wait_offline_poll(&self, serial_number: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let interval = self.settings.offline_poll_interval();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            time::sleep(interval.min(deadline - now)).await;
            if !self.is_online(serial_number) {
                return true;
            }
        }
        !self.is_online(serial_number)
    }

    /// Reconfiguration notification: resolve every offline waiter whose
    /// display is gone.
    pub(crate) fn on_reconfiguration(&self) {
        let pending = self.lock().offline.pending();
        if pending.is_empty() {
            return;
        }
        let gone: Vec<(u64, u64)> = pending
            .into_iter()
            .filter(|(_, serial)| !self.is_online(*serial as u32))
            .collect();
        if gone.is_empty() {
            return;
        }
        let mut state = self.lock();
        for (key, serial) in gone {
            if state.offline.resolve(key, serial, true) {
                log::debug!("Serial {} confirmed offline", serial);
            }
        }
    }
}
