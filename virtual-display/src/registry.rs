use std::collections::{HashMap, HashSet};

use crate::platform::VirtualDevice;
use crate::record::ConfigId;

struct LiveDevice {
    generation: u64,
    device: Box<dyn VirtualDevice>,
}

/// Outcome of a termination callback reaching the registry.
pub enum Termination {
    /// The callback belonged to the current generation. Carries the device if
    /// it was still live so the caller can drop it outside its lock.
    Accepted(Option<Box<dyn VirtualDevice>>),
    /// A superseded or already-settled generation; nothing changed.
    Stale { current: Option<u64> },
}

/// Which configs have a live device, and under which generation.
///
/// Generations are allocated from a single counter, so they never repeat for
/// any config. The tag for a config outlives its device: it is cleared only
/// once the OS confirms termination or a caller gives up waiting for it.
#[derive(Default)]
pub struct RuntimeRegistry {
    last_generation: u64,
    generations: HashMap<ConfigId, u64>,
    live: HashMap<ConfigId, LiveDevice>,
    running: HashSet<ConfigId>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags `id` with a fresh generation ahead of a creation attempt.
    pub fn allocate_generation(&mut self, id: ConfigId) -> u64 {
        self.last_generation += 1;
        self.generations.insert(id, self.last_generation);
        self.last_generation
    }

    pub fn generation(&self, id: ConfigId) -> Option<u64> {
        self.generations.get(&id).copied()
    }

    /// Clears the tag only if it still refers to `generation`.
    pub fn clear_generation_if(&mut self, id: ConfigId, generation: u64) -> bool {
        if self.generations.get(&id) == Some(&generation) {
            self.generations.remove(&id);
            true
        } else {
            false
        }
    }

    /// Records a successfully created device and marks the config running.
    ///
    /// Returns the device back if `generation` is no longer current, which
    /// happens when the OS already reported it gone during creation.
    pub fn install(
        &mut self,
        id: ConfigId,
        generation: u64,
        device: Box<dyn VirtualDevice>,
    ) -> Result<Option<Box<dyn VirtualDevice>>, Box<dyn VirtualDevice>> {
        if self.generation(id) != Some(generation) {
            return Err(device);
        }
        self.running.insert(id);
        let previous = self.live.insert(id, LiveDevice { generation, device });
        Ok(previous.map(|p| p.device))
    }

    /// Detaches the live device and clears the running flag. The generation
    /// tag stays behind so a later termination callback still matches.
    pub fn detach(&mut self, id: ConfigId) -> Option<Box<dyn VirtualDevice>> {
        self.running.remove(&id);
        self.live.remove(&id).map(|l| l.device)
    }

    /// Forgets everything about `id`, including its generation tag.
    pub fn purge(&mut self, id: ConfigId) -> Option<Box<dyn VirtualDevice>> {
        self.generations.remove(&id);
        self.detach(id)
    }

    pub fn on_terminated(&mut self, id: ConfigId, generation: u64) -> Termination {
        let current = self.generation(id);
        if current != Some(generation) {
            return Termination::Stale { current };
        }
        self.generations.remove(&id);
        let device = if self.live.get(&id).map(|l| l.generation) == Some(generation) {
            self.detach(id)
        } else {
            None
        };
        Termination::Accepted(device)
    }

    pub fn is_running(&self, id: ConfigId) -> bool {
        self.running.contains(&id)
    }

    pub fn has_live_device(&self, id: ConfigId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn display_id(&self, id: ConfigId) -> Option<u32> {
        self.live.get(&id).map(|l| l.device.display_id())
    }

    pub fn running_ids(&self) -> Vec<ConfigId> {
        let mut ids: Vec<ConfigId> = self.running.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Drops every device handle and tag, returning the handles.
    pub fn drain(&mut self) -> Vec<Box<dyn VirtualDevice>> {
        self.generations.clear();
        self.running.clear();
        self.live.drain().map(|(_, l)| l.device).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ModeSettings;

    struct FakeDevice(u32);

    impl VirtualDevice for FakeDevice {
        fn display_id(&self) -> u32 {
            self.0
        }

        fn apply(&mut self, _settings: &ModeSettings) -> bool {
            true
        }
    }

    fn install(registry: &mut RuntimeRegistry, id: ConfigId, display: u32) -> u64 {
        let generation = registry.allocate_generation(id);
        assert!(registry
            .install(id, generation, Box::new(FakeDevice(display)))
            .is_ok());
        generation
    }

    #[test]
    fn test_generations_strictly_increase() {
        let mut registry = RuntimeRegistry::new();
        let a = ConfigId::new();
        let b = ConfigId::new();
        let g1 = registry.allocate_generation(a);
        let g2 = registry.allocate_generation(b);
        let g3 = registry.allocate_generation(a);
        assert_eq!((g1, g2, g3), (1, 2, 3));
        assert_eq!(registry.generation(a), Some(3));
    }

    #[test]
    fn test_running_implies_live_device() {
        let mut registry = RuntimeRegistry::new();
        let id = ConfigId::new();
        install(&mut registry, id, 100);
        assert!(registry.is_running(id) && registry.has_live_device(id));
        assert_eq!(registry.display_id(id), Some(100));

        assert!(registry.detach(id).is_some());
        assert!(!registry.is_running(id));
        assert!(!registry.has_live_device(id));
        assert!(registry.generation(id).is_some());
    }

    #[test]
    fn test_stale_termination_leaves_state_untouched() {
        let mut registry = RuntimeRegistry::new();
        let id = ConfigId::new();
        let old = install(&mut registry, id, 100);
        let current = install(&mut registry, id, 101);

        match registry.on_terminated(id, old) {
            Termination::Stale { current: seen } => assert_eq!(seen, Some(current)),
            Termination::Accepted(_) => panic!("stale generation accepted"),
        }
        assert!(registry.is_running(id));
        assert_eq!(registry.display_id(id), Some(101));
        assert_eq!(registry.generation(id), Some(current));
    }

    #[test]
    fn test_accepted_termination_after_detach() {
        let mut registry = RuntimeRegistry::new();
        let id = ConfigId::new();
        let generation = install(&mut registry, id, 100);
        drop(registry.detach(id));

        match registry.on_terminated(id, generation) {
            Termination::Accepted(device) => assert!(device.is_none()),
            Termination::Stale { .. } => panic!("current generation rejected"),
        }
        assert_eq!(registry.generation(id), None);
    }

    #[test]
    fn test_accepted_termination_of_live_device_detaches_it() {
        let mut registry = RuntimeRegistry::new();
        let id = ConfigId::new();
        let generation = install(&mut registry, id, 100);
        match registry.on_terminated(id, generation) {
            Termination::Accepted(device) => assert!(device.is_some()),
            Termination::Stale { .. } => panic!("current generation rejected"),
        }
        assert!(!registry.is_running(id));
    }

    #[test]
    fn test_install_rejects_superseded_generation() {
        let mut registry = RuntimeRegistry::new();
        let id = ConfigId::new();
        let generation = registry.allocate_generation(id);
        registry.clear_generation_if(id, generation);
        assert!(registry
            .install(id, generation, Box::new(FakeDevice(1)))
            .is_err());
        assert!(!registry.is_running(id));
    }

    #[test]
    fn test_clear_generation_if_only_matches_current() {
        let mut registry = RuntimeRegistry::new();
        let id = ConfigId::new();
        let first = registry.allocate_generation(id);
        let second = registry.allocate_generation(id);
        assert!(!registry.clear_generation_if(id, first));
        assert!(registry.clear_generation_if(id, second));
        assert_eq!(registry.generation(id), None);
    }
}
