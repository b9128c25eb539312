use std::collections::BTreeSet;

use crate::error::DisplayError;
use crate::record::{ConfigId, DeviceConfig};

/// In-memory table of display configurations, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct ConfigStore {
    configs: Vec<DeviceConfig>,
}

impl ConfigStore {
    pub fn new(configs: Vec<DeviceConfig>) -> Self {
        Self { configs }
    }

    pub fn configs(&self) -> &[DeviceConfig] {
        &self.configs
    }

    pub fn get(&self, id: ConfigId) -> Option<&DeviceConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: ConfigId) -> Option<&mut DeviceConfig> {
        self.configs.iter_mut().find(|c| c.id == id)
    }

    pub fn contains(&self, id: ConfigId) -> bool {
        self.get(id).is_some()
    }

    /// Whether `serial` belongs to some config other than `except`.
    pub fn serial_in_use(&self, serial: u32, except: Option<ConfigId>) -> bool {
        self.configs
            .iter()
            .any(|c| c.serial_number == serial && Some(c.id) != except)
    }

    pub fn insert(&mut self, config: DeviceConfig) -> Result<(), DisplayError> {
        config.validate()?;
        if self.contains(config.id) {
            return Err(DisplayError::InvalidConfiguration(format!(
                "a display with id {} already exists",
                config.id
            )));
        }
        if self.serial_in_use(config.serial_number, None) {
            return Err(DisplayError::DuplicateSerialNumber(config.serial_number));
        }
        self.configs.push(config);
        Ok(())
    }

    /// Replaces the record with the same id, returning the previous one.
    pub fn replace(&mut self, config: DeviceConfig) -> Result<DeviceConfig, DisplayError> {
        config.validate()?;
        if self.serial_in_use(config.serial_number, Some(config.id)) {
            return Err(DisplayError::DuplicateSerialNumber(config.serial_number));
        }
        let slot = self
            .get_mut(config.id)
            .ok_or(DisplayError::ConfigNotFound(config.id))?;
        Ok(std::mem::replace(slot, config))
    }

    pub fn remove(&mut self, id: ConfigId) -> Option<DeviceConfig> {
        let index = self.configs.iter().position(|c| c.id == id)?;
        Some(self.configs.remove(index))
    }

    /// Returns the previous value, or `None` if the config is unknown.
    pub fn set_desired_enabled(&mut self, id: ConfigId, enabled: bool) -> Option<bool> {
        let config = self.get_mut(id)?;
        Some(std::mem::replace(&mut config.desired_enabled, enabled))
    }

    pub fn desired_serials(&self) -> BTreeSet<u32> {
        self.configs
            .iter()
            .filter(|c| c.desired_enabled)
            .map(|c| c.serial_number)
            .collect()
    }

    pub fn serials(&self) -> Vec<u32> {
        self.configs.iter().map(|c| c.serial_number).collect()
    }

    /// Smallest serial number not taken by any config.
    pub fn next_free_serial(&self) -> u32 {
        let used: BTreeSet<u32> = self.configs.iter().map(|c| c.serial_number).collect();
        (1..=u32::MAX).find(|s| !used.contains(s)).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DisplayMode;

    fn config(name: &str, serial: u32) -> DeviceConfig {
        DeviceConfig::new(name, serial, DisplayMode::default())
    }

    #[test]
    fn test_insert_rejects_duplicate_serial() {
        let mut store = ConfigStore::default();
        store.insert(config("A", 1)).unwrap();
        let err = store.insert(config("B", 1)).unwrap_err();
        assert!(matches!(err, DisplayError::DuplicateSerialNumber(1)));
        assert_eq!(store.configs().len(), 1);
    }

    #[test]
    fn test_replace_allows_keeping_own_serial() {
        let mut store = ConfigStore::default();
        let mut a = config("A", 1);
        store.insert(a.clone()).unwrap();
        a.name = "Renamed".into();
        let previous = store.replace(a.clone()).unwrap();
        assert_eq!(previous.name, "A");
        assert_eq!(store.get(a.id).unwrap().name, "Renamed");
    }

    #[test]
    fn test_replace_rejects_serial_of_other_config() {
        let mut store = ConfigStore::default();
        let mut a = config("A", 1);
        store.insert(a.clone()).unwrap();
        store.insert(config("B", 2)).unwrap();
        a.serial_number = 2;
        assert!(matches!(
            store.replace(a),
            Err(DisplayError::DuplicateSerialNumber(2))
        ));
    }

    #[test]
    fn test_replace_unknown_config() {
        let mut store = ConfigStore::default();
        let a = config("A", 1);
        assert!(matches!(
            store.replace(a),
            Err(DisplayError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn test_next_free_serial_fills_gaps() {
        let mut store = ConfigStore::default();
        store.insert(config("A", 1)).unwrap();
        store.insert(config("C", 3)).unwrap();
        assert_eq!(store.next_free_serial(), 2);
    }

    #[test]
    fn test_desired_serials_only_enabled() {
        let mut store = ConfigStore::default();
        let a = config("A", 1);
        let b = config("B", 2);
        store.insert(a.clone()).unwrap();
        store.insert(b).unwrap();
        assert_eq!(store.set_desired_enabled(a.id, false), Some(true));
        assert_eq!(store.desired_serials().into_iter().collect::<Vec<_>>(), vec![2]);
    }
}
