//! Lifecycle coordinator for managed virtual displays.
//!
//! All bookkeeping lives in one [`State`] behind a mutex that is only ever held
//! for a synchronous step, never across an `.await`. Each step therefore runs
//! as a unit: OS callbacks and other operations are observed between steps,
//! never in the middle of one, which keeps the generation checks race-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::error::{DisplayError, StoreError};
use crate::persist::ConfigPersistence;
use crate::platform::{
    DeviceDescriptor, ManagedIdentity, ModeSettings, Platform, ReconfigurationHandler,
    TerminationCallback,
};
use crate::record::{ConfigId, DeviceConfig};
use crate::registry::{RuntimeRegistry, Termination};
use crate::retry::RetryPolicy;
use crate::settings::CoordinatorSettings;
use crate::store::ConfigStore;
use crate::teardown::{OfflineMode, TeardownWait};
use crate::waiter::WaiterTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Disabled,
    Creating,
    Running,
    /// Detached, but the OS has not confirmed the teardown yet.
    Disabling,
    Rebuilding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Enabling,
    Rebuilding,
}

pub(crate) struct State {
    pub(crate) store: ConfigStore,
    pub(crate) registry: RuntimeRegistry,
    pub(crate) terminations: WaiterTable<ConfigId>,
    pub(crate) offline: WaiterTable<u64>,
    next_offline_key: u64,
    in_flight: HashMap<ConfigId, Operation>,
    /// Set by `shutdown`; no device is created afterwards.
    shut_down: bool,
}

impl State {
    fn phase(&self, id: ConfigId) -> LifecyclePhase {
        match self.in_flight.get(&id) {
            Some(Operation::Enabling) => LifecyclePhase::Creating,
            Some(Operation::Rebuilding) => LifecyclePhase::Rebuilding,
            None if self.registry.is_running(id) => LifecyclePhase::Running,
            None if self.registry.generation(id).is_some() => LifecyclePhase::Disabling,
            None => LifecyclePhase::Disabled,
        }
    }

    pub(crate) fn next_offline_key(&mut self) -> u64 {
        self.next_offline_key += 1;
        self.next_offline_key
    }

    fn serial_of(&self, id: ConfigId) -> Result<u32, DisplayError> {
        self.store
            .get(id)
            .map(|c| c.serial_number)
            .ok_or(DisplayError::ConfigNotFound(id))
    }
}

pub(crate) struct Inner {
    pub(crate) settings: CoordinatorSettings,
    pub(crate) platform: Platform,
    persistence: Arc<dyn ConfigPersistence>,
    pub(crate) offline_mode: OfflineMode,
    listening: AtomicBool,
    state: Mutex<State>,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn identity(&self, serial_number: u32) -> ManagedIdentity {
        ManagedIdentity {
            vendor_id: self.settings.vendor_id,
            product_id: self.settings.product_id,
            serial_number,
        }
    }

    fn persist(&self, state: &State) -> Result<(), StoreError> {
        self.persistence.save_configs(state.store.configs())
    }

    /// Desired-state writes must not block the runtime operation.
    fn persist_or_log(&self, state: &State) {
        if let Err(e) = self.persist(state) {
            log::error!("Failed to save display configurations: {}", e);
        }
    }

    fn termination_callback(self: &Arc<Self>, id: ConfigId, generation: u64) -> TerminationCallback {
        let weak = Arc::downgrade(self);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_device_terminated(id, generation);
            }
        })
    }

    fn on_device_terminated(&self, id: ConfigId, generation: u64) {
        let released = {
            let mut state = self.lock();
            match state.registry.on_terminated(id, generation) {
                Termination::Accepted(device) => {
                    if device.is_some() {
                        log::warn!("Virtual display {} (generation {}) went away while running", id, generation);
                    } else {
                        log::info!("Virtual display {} generation {} terminated", id, generation);
                    }
                    state.terminations.resolve(id, generation, true);
                    device
                }
                Termination::Stale { current } => {
                    log::debug!(
                        "Dropping stale termination of {} generation {} (current {:?})",
                        id,
                        generation,
                        current
                    );
                    None
                }
            }
        };
        drop(released);
    }

    /// Creates the device for `id` once. `Ok(false)` means the config was
    /// removed or disabled in the meantime and nothing was created.
    fn try_create(self: &Arc<Self>, id: ConfigId, attempt: u32) -> Result<bool, DisplayError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            log::info!("Creation of {} abandoned, coordinator is shut down", id);
            return Ok(false);
        }
        let config = match state.store.get(id) {
            Some(config) if config.desired_enabled => config.clone(),
            _ => {
                log::info!("Creation of {} superseded", id);
                return Ok(false);
            }
        };
        config.validate()?;
        let serial_taken = state.registry.running_ids().into_iter().any(|other| {
            other != id && state.store.get(other).map(|c| c.serial_number) == Some(config.serial_number)
        });
        if serial_taken {
            return Err(DisplayError::DuplicateSerialNumber(config.serial_number));
        }

        let generation = state.registry.allocate_generation(id);
        let descriptor =
            DeviceDescriptor::for_config(&config, self.settings.vendor_id, self.settings.product_id);
        let callback = self.termination_callback(id, generation);
        let Some(mut device) = self.platform.backend.create_device(&descriptor, callback) else {
            state.registry.clear_generation_if(id, generation);
            log::warn!("Backend refused to create \"{}\" (attempt {})", config.name, attempt);
            return Err(DisplayError::CreationFailed);
        };

        if !device.apply(&ModeSettings::for_config(&config)) {
            // The tag stays: the OS may still report this device terminated.
            log::warn!(
                "Applying modes to \"{}\" failed (attempt {}, generation {})",
                config.name,
                attempt,
                generation
            );
            drop(guard);
            drop(device);
            return Err(DisplayError::CreationFailed);
        }

        let display_id = device.display_id();
        match state.registry.install(id, generation, device) {
            Ok(previous) => {
                log::info!(
                    "Virtual display \"{}\" running as display {} (generation {})",
                    config.name,
                    display_id,
                    generation
                );
                drop(guard);
                drop(previous);
                Ok(true)
            }
            Err(device) => {
                drop(guard);
                drop(device);
                Err(DisplayError::CreationFailed)
            }
        }
    }

    /// Waits out the teardown of `generation`, then creates a new device and
    /// checks the resulting topology.
    async fn bring_up(
        self: &Arc<Self>,
        id: ConfigId,
        serial: u32,
        pending: Option<u64>,
    ) -> Result<(), DisplayError> {
        let confirmed = match pending {
            Some(generation) => self.settle_teardown(id, serial, generation).await?,
            None => true,
        };

        let policy = RetryPolicy::for_teardown(confirmed);
        if !policy.run(|attempt| self.try_create(id, attempt)).await? {
            return Ok(());
        }

        if let Err(e) = self.verify_topology_after_enable().await {
            log::error!("Rolling back virtual display {}: {}", id, e);
            let device = self.lock().registry.detach(id);
            drop(device);
            return Err(e);
        }
        Ok(())
    }

    async fn settle_teardown(
        self: &Arc<Self>,
        id: ConfigId,
        serial: u32,
        generation: u64,
    ) -> Result<bool, DisplayError> {
        let wait = self
            .await_termination(id, generation, self.settings.termination_timeout())
            .await;
        if wait == TeardownWait::Cancelled && self.lock().shut_down {
            // Creation is skipped anyway, so the offline wait is pointless.
            return Ok(false);
        }
        if wait == TeardownWait::TimedOut
            && self.lock().registry.clear_generation_if(id, generation)
        {
            log::warn!(
                "No termination reported for {} generation {}, checking whether it is offline",
                id,
                generation
            );
        }
        if !self
            .wait_for_offline(serial, self.settings.offline_timeout())
            .await
        {
            log::error!("Display with serial {} is still online", serial);
            return Err(DisplayError::TeardownTimedOut);
        }
        Ok(wait == TeardownWait::Confirmed)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.listening.swap(false, Ordering::SeqCst) {
            if let Some(notifier) = &self.platform.notifier {
                notifier.stop();
            }
        }
    }
}

/// Clears the in-flight marker when an operation ends or is cancelled.
struct InFlight<'a> {
    inner: &'a Inner,
    id: ConfigId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.lock().in_flight.remove(&self.id);
    }
}

/// Creates, enables, disables, rebuilds and destroys managed virtual displays.
#[derive(Clone)]
pub struct DisplayCoordinator {
    inner: Arc<Inner>,
}

impl DisplayCoordinator {
    /// Loads the stored configurations and registers for topology
    /// notifications. Offline waits fall back to polling when the notifier is
    /// missing or refuses the registration.
    pub fn new(
        settings: CoordinatorSettings,
        platform: Platform,
        persistence: Arc<dyn ConfigPersistence>,
    ) -> Result<Self, StoreError> {
        let configs = persistence.load_configs()?;
        log::info!("Loaded {} display configuration(s)", configs.len());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let offline_mode = match &platform.notifier {
                Some(notifier) => {
                    let weak = weak.clone();
                    let handler: ReconfigurationHandler = Arc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_reconfiguration();
                        }
                    });
                    if notifier.start(handler) {
                        OfflineMode::Push
                    } else {
                        log::warn!("Display reconfiguration notifications unavailable, polling instead");
                        OfflineMode::Poll
                    }
                }
                None => OfflineMode::Poll,
            };
            Inner {
                settings,
                persistence,
                offline_mode,
                listening: AtomicBool::new(offline_mode == OfflineMode::Push),
                state: Mutex::new(State {
                    store: ConfigStore::new(configs),
                    registry: RuntimeRegistry::new(),
                    terminations: WaiterTable::new(),
                    offline: WaiterTable::new(),
                    next_offline_key: 0,
                    in_flight: HashMap::new(),
                    shut_down: false,
                }),
                platform,
            }
        });
        Ok(Self { inner })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    pub fn offline_mode(&self) -> OfflineMode {
        self.inner.offline_mode
    }

    pub fn configs(&self) -> Vec<DeviceConfig> {
        self.inner.lock().store.configs().to_vec()
    }

    pub fn config(&self, id: ConfigId) -> Option<DeviceConfig> {
        self.inner.lock().store.get(id).cloned()
    }

    pub fn is_running(&self, id: ConfigId) -> bool {
        self.inner.lock().registry.is_running(id)
    }

    pub fn has_live_device(&self, id: ConfigId) -> bool {
        self.inner.lock().registry.has_live_device(id)
    }

    pub fn phase(&self, id: ConfigId) -> LifecyclePhase {
        self.inner.lock().phase(id)
    }

    pub fn generation(&self, id: ConfigId) -> Option<u64> {
        self.inner.lock().registry.generation(id)
    }

    pub fn display_id(&self, id: ConfigId) -> Option<u32> {
        self.inner.lock().registry.display_id(id)
    }

    pub fn running_ids(&self) -> Vec<ConfigId> {
        self.inner.lock().registry.running_ids()
    }

    pub fn next_free_serial(&self) -> u32 {
        self.inner.lock().store.next_free_serial()
    }

    pub fn pending_termination_waiters(&self) -> usize {
        self.inner.lock().terminations.len()
    }

    pub fn pending_offline_waiters(&self) -> usize {
        self.inner.lock().offline.len()
    }

    /// Waits until the OS confirms `generation` of `id` terminated.
    pub async fn wait_for_termination(
        &self,
        id: ConfigId,
        generation: u64,
        timeout: Duration,
    ) -> bool {
        self.inner.await_termination(id, generation, timeout).await == TeardownWait::Confirmed
    }

    /// Waits until no display with this serial and the managed vendor and
    /// product ids is online.
    pub async fn wait_for_managed_display_offline(&self, serial_number: u32, timeout: Duration) -> bool {
        self.inner.wait_for_offline(serial_number, timeout).await
    }

    /// Fails if disabling `id` would leave the system without a main display.
    pub fn check_disable_safety(&self, id: ConfigId) -> Result<(), DisplayError> {
        let serial = self.inner.lock().serial_of(id)?;
        self.inner.check_disable_safety(serial)
    }

    /// Adds a new display configuration and, if it is desired enabled,
    /// creates its device. A creation failure removes the record again.
    pub async fn add_display(&self, config: DeviceConfig) -> Result<ConfigId, DisplayError> {
        let id = config.id;
        let enable = config.desired_enabled;
        {
            let mut state = self.inner.lock();
            if state.shut_down && enable {
                return Err(DisplayError::ShutDown);
            }
            state.store.insert(config)?;
            if let Err(e) = self.inner.persist(&state) {
                state.store.remove(id);
                return Err(e.into());
            }
        }
        log::info!("Added display configuration {}", id);
        if !enable {
            return Ok(id);
        }

        match self.enable(id).await {
            Err(DisplayError::CreationFailed) => {
                let device = {
                    let mut state = self.inner.lock();
                    state.store.remove(id);
                    self.inner.persist_or_log(&state);
                    state.registry.purge(id)
                };
                drop(device);
                log::warn!("Removed display configuration {} after creation failed", id);
                Err(DisplayError::CreationFailed)
            }
            Err(e) => Err(e),
            Ok(()) => Ok(id),
        }
    }

    /// Replaces a stored configuration. A running display keeps its current
    /// modes until it is rebuilt.
    pub fn update_display(&self, config: DeviceConfig) -> Result<(), DisplayError> {
        let mut state = self.inner.lock();
        let previous = state
            .store
            .get(config.id)
            .ok_or(DisplayError::ConfigNotFound(config.id))?;
        let live = state.registry.is_running(config.id) || state.registry.generation(config.id).is_some();
        if live && previous.serial_number != config.serial_number {
            return Err(DisplayError::InvalidConfiguration(
                "serial number cannot change while the display exists".into(),
            ));
        }
        state.store.replace(config)?;
        self.inner.persist(&state)?;
        Ok(())
    }

    pub async fn enable(&self, id: ConfigId) -> Result<(), DisplayError> {
        let (serial, pending) = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return Err(DisplayError::ShutDown);
            }
            if state.store.set_desired_enabled(id, true).is_none() {
                return Err(DisplayError::ConfigNotFound(id));
            }
            self.inner.persist_or_log(&state);
            match state.phase(id) {
                LifecyclePhase::Running | LifecyclePhase::Creating | LifecyclePhase::Rebuilding => {
                    log::debug!("Virtual display {} is already up or on its way", id);
                    return Ok(());
                }
                LifecyclePhase::Disabled | LifecyclePhase::Disabling => {}
            }
            let serial = state.serial_of(id)?;
            state.in_flight.insert(id, Operation::Enabling);
            (serial, state.registry.generation(id))
        };
        let _in_flight = InFlight {
            inner: self.inner.as_ref(),
            id,
        };
        log::info!("Enabling virtual display {}", id);
        self.inner.bring_up(id, serial, pending).await
    }

    pub async fn disable(&self, id: ConfigId) -> Result<(), DisplayError> {
        let (serial, running) = {
            let state = self.inner.lock();
            (state.serial_of(id)?, state.registry.is_running(id))
        };
        if running {
            self.inner.check_disable_safety(serial)?;
        }

        let device = {
            let mut state = self.inner.lock();
            if state.store.set_desired_enabled(id, false).is_none() {
                return Err(DisplayError::ConfigNotFound(id));
            }
            self.inner.persist_or_log(&state);
            state.terminations.cancel(id);
            state.registry.detach(id)
        };
        if device.is_some() {
            log::info!("Disabled virtual display {}", id);
        }
        drop(device);
        Ok(())
    }

    /// Tears the running device down and creates it again from the current
    /// configuration.
    pub async fn rebuild(&self, id: ConfigId) -> Result<(), DisplayError> {
        let (serial, running) = {
            let state = self.inner.lock();
            (state.serial_of(id)?, state.registry.is_running(id))
        };
        if !running {
            log::debug!("Virtual display {} is not running, nothing to rebuild", id);
            return Ok(());
        }
        self.inner.check_not_main(serial)?;

        let (device, pending) = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return Err(DisplayError::ShutDown);
            }
            if state.in_flight.contains_key(&id) || !state.registry.is_running(id) {
                return Ok(());
            }
            state.in_flight.insert(id, Operation::Rebuilding);
            state.terminations.cancel(id);
            let device = state.registry.detach(id);
            (device, state.registry.generation(id))
        };
        let _in_flight = InFlight {
            inner: self.inner.as_ref(),
            id,
        };
        log::info!("Rebuilding virtual display {}", id);
        drop(device);
        self.inner.bring_up(id, serial, pending).await
    }

    /// Removes a configuration and all runtime state for it, without waiting
    /// for the OS to finish tearing the device down.
    pub fn destroy(&self, id: ConfigId) -> Result<(), DisplayError> {
        let (device, saved) = {
            let mut state = self.inner.lock();
            let removed = state.store.remove(id).is_some();
            if !removed && state.registry.generation(id).is_none() {
                return Err(DisplayError::ConfigNotFound(id));
            }
            state.terminations.cancel(id);
            let device = state.registry.purge(id);
            (device, self.inner.persist(&state))
        };
        drop(device);
        log::info!("Destroyed virtual display {}", id);
        saved.map_err(DisplayError::from)
    }

    /// Enables every configuration whose desired state is enabled. Failures
    /// are logged and returned; they do not stop the remaining configs.
    pub async fn restore_desired(&self) -> Vec<(ConfigId, DisplayError)> {
        let wanted: Vec<ConfigId> = self
            .inner
            .lock()
            .store
            .configs()
            .iter()
            .filter(|c| c.desired_enabled)
            .map(|c| c.id)
            .collect();
        let mut failures = Vec::new();
        for id in wanted {
            if let Err(e) = self.enable(id).await {
                log::error!("Could not restore virtual display {}: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }

    /// Releases every device and waiter. Desired state is left as is, so the
    /// next start restores the same displays. Operations still suspended
    /// finish without creating anything, and later enables and rebuilds
    /// fail with `ShutDown`.
    pub fn shutdown(&self) {
        if self.inner.listening.swap(false, Ordering::SeqCst) {
            if let Some(notifier) = &self.inner.platform.notifier {
                notifier.stop();
            }
        }
        let devices = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            let waiters = state.terminations.cancel_all() + state.offline.cancel_all();
            if waiters > 0 {
                log::debug!("Cancelled {} pending waiter(s)", waiters);
            }
            state.registry.drain()
        };
        log::info!("Shutting down {} virtual display(s)", devices.len());
        drop(devices);
    }
}
