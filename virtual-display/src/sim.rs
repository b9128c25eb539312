//! In-process stand-in for the OS display subsystem.
//!
//! Devices come online when their modes are applied and disappear some time
//! after their handle is dropped, with the termination callback and the
//! offline transition on independent timers. Every knob needed to reproduce
//! the awkward cases (missing callbacks, slow teardown, refused creation,
//! collapsed mirror sets, oscillating topology) is exposed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::platform::{
    DeviceBackend, DeviceDescriptor, ManagedIdentity, ModeSettings, Platform,
    ReconfigurationHandler, ReconfigurationNotifier, TerminationCallback, TopologyInspector,
    TopologyRepairer, VirtualDevice,
};
use crate::topology::{DisplayInfo, Rect, TopologySnapshot};

const FIRST_VIRTUAL_ID: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairCall {
    pub managed_ids: Vec<u32>,
    pub anchor_id: u32,
}

#[derive(Debug, Clone)]
struct OnlineDevice {
    identity: ManagedIdentity,
    bounds: Rect,
}

struct SimState {
    physical: Vec<Rect>,
    main_display_id: Option<u32>,
    online: BTreeMap<u32, OnlineDevice>,
    next_display_id: u32,
    termination_delay: Option<Duration>,
    offline_delay: Duration,
    failing_applies: u32,
    refuse_creation: bool,
    created: usize,
    notifier_available: bool,
    handlers: Vec<ReconfigurationHandler>,
    inspector_available: bool,
    script: VecDeque<Option<TopologySnapshot>>,
    cycle_script: bool,
    mirror_of: HashMap<u32, u32>,
    stacked: bool,
    repair_result: bool,
    repairs: Vec<RepairCall>,
}

/// Simulated display subsystem implementing every platform collaborator.
#[derive(Clone)]
pub struct SimulatedPlatform {
    shared: Arc<Mutex<SimState>>,
}

impl SimulatedPlatform {
    /// One 1920x1080 physical display at the origin, acting as main.
    pub fn new() -> Self {
        let sim = Self::headless();
        sim.add_physical_display(Rect::new(0, 0, 1920, 1080));
        sim
    }

    /// No physical displays at all.
    pub fn headless() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SimState {
                physical: Vec::new(),
                main_display_id: None,
                online: BTreeMap::new(),
                next_display_id: FIRST_VIRTUAL_ID,
                termination_delay: Some(Duration::from_millis(30)),
                offline_delay: Duration::from_millis(60),
                failing_applies: 0,
                refuse_creation: false,
                created: 0,
                notifier_available: true,
                handlers: Vec::new(),
                inspector_available: true,
                script: VecDeque::new(),
                cycle_script: false,
                mirror_of: HashMap::new(),
                stacked: false,
                repair_result: true,
                repairs: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn platform(&self) -> Platform {
        Platform {
            backend: Arc::new(self.clone()),
            inspector: Arc::new(self.clone()),
            repairer: Arc::new(self.clone()),
            notifier: Some(Arc::new(self.clone())),
        }
    }

    /// Physical display ids are 1-based in insertion order.
    pub fn add_physical_display(&self, bounds: Rect) -> u32 {
        let mut state = self.lock();
        state.physical.push(bounds);
        state.physical.len() as u32
    }

    /// `None` makes the OS never report termination.
    pub fn set_termination_delay(&self, delay: Option<Duration>) {
        self.lock().termination_delay = delay;
    }

    pub fn set_offline_delay(&self, delay: Duration) {
        self.lock().offline_delay = delay;
    }

    /// The next `count` mode applications are rejected.
    pub fn fail_next_applies(&self, count: u32) {
        self.lock().failing_applies = count;
    }

    pub fn set_refuse_creation(&self, refuse: bool) {
        self.lock().refuse_creation = refuse;
    }

    pub fn set_notifier_available(&self, available: bool) {
        self.lock().notifier_available = available;
    }

    pub fn set_inspector_available(&self, available: bool) {
        self.lock().inspector_available = available;
    }

    /// Serves these samples before falling back to the live topology. With
    /// `cycle`, the script repeats forever.
    pub fn script_snapshots(&self, samples: Vec<Option<TopologySnapshot>>, cycle: bool) {
        let mut state = self.lock();
        state.script = samples.into();
        state.cycle_script = cycle;
    }

    /// Puts the display with `serial` into the mirror set of `master_serial`.
    pub fn mirror(&self, serial: u32, master_serial: u32) {
        self.lock().mirror_of.insert(serial, master_serial);
    }

    /// Places every managed display at the same origin.
    pub fn stack_managed_displays(&self, stacked: bool) {
        self.lock().stacked = stacked;
    }

    pub fn set_main_display(&self, display_id: u32) {
        self.lock().main_display_id = Some(display_id);
    }

    pub fn set_repair_result(&self, result: bool) {
        self.lock().repair_result = result;
    }

    pub fn repairs(&self) -> Vec<RepairCall> {
        self.lock().repairs.clone()
    }

    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    pub fn display_for_serial(&self, serial: u32) -> Option<u32> {
        self.lock()
            .online
            .iter()
            .find(|(_, d)| d.identity.serial_number == serial)
            .map(|(id, _)| *id)
    }

    pub fn online_count(&self) -> usize {
        self.lock().online.len()
    }

    fn schedule_notification(&self) {
        let handlers = self.lock().handlers.clone();
        if handlers.is_empty() {
            return;
        }
        run_later(Duration::ZERO, move || {
            for handler in handlers {
                handler();
            }
        });
    }

    fn next_origin_x(state: &SimState) -> i32 {
        state
            .physical
            .iter()
            .chain(state.online.values().map(|d| &d.bounds))
            .map(|b| b.x + b.width as i32)
            .max()
            .unwrap_or(0)
    }

    fn live_snapshot(state: &SimState, tracked: &[u32], vendor_id: u32, product_id: u32) -> TopologySnapshot {
        let mut displays: Vec<DisplayInfo> = state
            .physical
            .iter()
            .enumerate()
            .map(|(i, bounds)| DisplayInfo {
                id: i as u32 + 1,
                serial_number: 0,
                is_managed_virtual_device: false,
                is_in_mirror_set: false,
                mirror_master_id: None,
                bounds: *bounds,
            })
            .collect();

        let display_of = |serial: u32| {
            state
                .online
                .iter()
                .find(|(_, d)| d.identity.serial_number == serial)
                .map(|(id, d)| (*id, d.bounds))
        };
        let stacked_origin = state.online.values().next().map(|d| d.bounds);

        for (id, device) in &state.online {
            let identity = device.identity;
            let mut info = DisplayInfo {
                id: *id,
                serial_number: identity.serial_number,
                is_managed_virtual_device: identity.vendor_id == vendor_id
                    && identity.product_id == product_id
                    && tracked.contains(&identity.serial_number),
                is_in_mirror_set: false,
                mirror_master_id: None,
                bounds: device.bounds,
            };
            if state.stacked {
                if let Some(origin) = stacked_origin {
                    info.bounds = origin;
                }
            }
            if let Some((master_id, master_bounds)) = state
                .mirror_of
                .get(&identity.serial_number)
                .and_then(|master| display_of(*master))
            {
                info.is_in_mirror_set = true;
                info.mirror_master_id = Some(master_id);
                info.bounds = master_bounds;
            }
            displays.push(info);
        }

        let masters: Vec<u32> = displays.iter().filter_map(|d| d.mirror_master_id).collect();
        for display in displays.iter_mut().filter(|d| masters.contains(&d.id)) {
            display.is_in_mirror_set = true;
        }

        let main_display_id = state
            .main_display_id
            .filter(|id| displays.iter().any(|d| d.id == *id))
            .or_else(|| displays.first().map(|d| d.id))
            .unwrap_or(0);
        TopologySnapshot {
            main_display_id,
            displays,
        }
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` after `delay` on the tokio runtime if there is one, otherwise on a
/// helper thread.
fn run_later(delay: Duration, f: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                f();
            });
        }
        Err(_) => {
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                f();
            });
        }
    }
}

struct SimDevice {
    platform: SimulatedPlatform,
    display_id: u32,
    identity: ManagedIdentity,
    on_terminated: Option<TerminationCallback>,
}

impl VirtualDevice for SimDevice {
    fn display_id(&self) -> u32 {
        self.display_id
    }

    fn apply(&mut self, settings: &ModeSettings) -> bool {
        let Some(mode) = settings.modes.first() else {
            return false;
        };
        {
            let mut state = self.platform.lock();
            if state.failing_applies > 0 {
                state.failing_applies -= 1;
                return false;
            }
            // The OS has not released the previous device with this identity.
            if state
                .online
                .iter()
                .any(|(id, d)| *id != self.display_id && d.identity == self.identity)
            {
                return false;
            }
            let x = SimulatedPlatform::next_origin_x(&state);
            let bounds = Rect::new(x, 0, mode.width, mode.height);
            state.online.insert(
                self.display_id,
                OnlineDevice {
                    identity: self.identity,
                    bounds,
                },
            );
        }
        self.platform.schedule_notification();
        true
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let (termination_delay, offline_delay) = {
            let state = self.platform.lock();
            (state.termination_delay, state.offline_delay)
        };

        if let (Some(delay), Some(callback)) = (termination_delay, self.on_terminated.take()) {
            run_later(delay, callback);
        }

        let platform = self.platform.clone();
        let display_id = self.display_id;
        run_later(offline_delay, move || {
            let removed = platform.lock().online.remove(&display_id).is_some();
            if removed {
                platform.schedule_notification();
            }
        });
    }
}

impl DeviceBackend for SimulatedPlatform {
    fn create_device(
        &self,
        descriptor: &DeviceDescriptor,
        on_terminated: TerminationCallback,
    ) -> Option<Box<dyn VirtualDevice>> {
        let display_id = {
            let mut state = self.lock();
            if state.refuse_creation {
                return None;
            }
            state.created += 1;
            let id = state.next_display_id;
            state.next_display_id += 1;
            id
        };
        log::debug!(
            "Simulated display {} created for \"{}\" serial {}",
            display_id,
            descriptor.name,
            descriptor.identity.serial_number
        );
        Some(Box::new(SimDevice {
            platform: self.clone(),
            display_id,
            identity: descriptor.identity,
            on_terminated: Some(on_terminated),
        }))
    }
}

impl TopologyInspector for SimulatedPlatform {
    fn snapshot(
        &self,
        tracked_serials: &[u32],
        vendor_id: u32,
        product_id: u32,
    ) -> Option<TopologySnapshot> {
        let mut state = self.lock();
        if let Some(sample) = state.script.pop_front() {
            if state.cycle_script {
                state.script.push_back(sample.clone());
            }
            return sample;
        }
        if !state.inspector_available {
            return None;
        }
        Some(Self::live_snapshot(&state, tracked_serials, vendor_id, product_id))
    }

    fn is_display_online(&self, identity: ManagedIdentity) -> bool {
        self.lock().online.values().any(|d| d.identity == identity)
    }
}

impl TopologyRepairer for SimulatedPlatform {
    fn repair(&self, _snapshot: &TopologySnapshot, managed_ids: &[u32], anchor_id: u32) -> bool {
        let result = {
            let mut state = self.lock();
            state.repairs.push(RepairCall {
                managed_ids: managed_ids.to_vec(),
                anchor_id,
            });
            if state.repair_result {
                state.mirror_of.clear();
                state.stacked = false;
                state.main_display_id = Some(anchor_id);
            }
            state.repair_result
        };
        if result {
            self.schedule_notification();
        }
        result
    }
}

impl ReconfigurationNotifier for SimulatedPlatform {
    fn start(&self, handler: ReconfigurationHandler) -> bool {
        let mut state = self.lock();
        if !state.notifier_available {
            return false;
        }
        state.handlers.push(handler);
        true
    }

    fn stop(&self) {
        self.lock().handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(serial: u32) -> ManagedIdentity {
        ManagedIdentity {
            vendor_id: 0x3456,
            product_id: 0x1234,
            serial_number: serial,
        }
    }

    fn descriptor(serial: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            name: format!("Sim {}", serial),
            identity: identity(serial),
            max_pixels_wide: 1920,
            max_pixels_high: 1080,
            size_millimeters: (443, 249),
        }
    }

    fn settings() -> ModeSettings {
        ModeSettings {
            hi_dpi: false,
            modes: vec![crate::record::DisplayMode::default()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_lifecycle() {
        let sim = SimulatedPlatform::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut device = sim
            .create_device(&descriptor(5), Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        assert!(!sim.is_display_online(identity(5)));
        assert!(device.apply(&settings()));
        assert!(sim.is_display_online(identity(5)));
        assert_eq!(sim.display_for_serial(5), Some(device.display_id()));

        let snapshot = sim.snapshot(&[5], 0x3456, 0x1234).unwrap();
        assert_eq!(snapshot.main_display_id, 1);
        let info = snapshot.managed_display_for_serial(5).unwrap();
        assert_eq!(info.bounds, Rect::new(1920, 0, 1920, 1080));

        drop(device);
        rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sim.is_display_online(identity(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_fails_while_identity_still_online() {
        let sim = SimulatedPlatform::new();
        let mut first = sim.create_device(&descriptor(5), Box::new(|| {})).unwrap();
        assert!(first.apply(&settings()));
        drop(first);

        let mut second = sim.create_device(&descriptor(5), Box::new(|| {})).unwrap();
        assert!(!second.apply(&settings()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(second.apply(&settings()));
    }

    #[test]
    fn test_unavailable_notifier_refuses_registration() {
        let sim = SimulatedPlatform::new();
        sim.set_notifier_available(false);
        assert!(!sim.start(Arc::new(|| {})));
    }

    #[test]
    fn test_scripted_snapshots_cycle() {
        let sim = SimulatedPlatform::new();
        let a = TopologySnapshot {
            main_display_id: 1,
            displays: Vec::new(),
        };
        let b = TopologySnapshot {
            main_display_id: 2,
            displays: Vec::new(),
        };
        sim.script_snapshots(vec![Some(a.clone()), Some(b.clone())], true);
        assert_eq!(sim.snapshot(&[], 0, 0), Some(a.clone()));
        assert_eq!(sim.snapshot(&[], 0, 0), Some(b));
        assert_eq!(sim.snapshot(&[], 0, 0), Some(a));
    }
}
