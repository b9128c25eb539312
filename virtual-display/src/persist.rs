//! Persistence of display configurations.
//!
//! The on-disk format is a versioned JSON document:
//!
//! ```json
//! { "schemaVersion": 1, "configs": [ { "id": "...", "name": "...", ... } ] }
//! ```
//!
//! Older builds wrote a bare array of configs. Such files are rejected rather
//! than guessed at. Loaded entries are sanitized so the rest of the crate can
//! rely on unique ids, unique non-zero serial numbers and non-empty modes.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::record::{physical_size_for, ConfigId, DeviceConfig, DisplayMode};

pub const SCHEMA_VERSION: u32 = 1;

/// Loads and saves the full set of display configurations.
pub trait ConfigPersistence: Send + Sync {
    fn load_configs(&self) -> Result<Vec<DeviceConfig>, StoreError>;
    fn save_configs(&self, configs: &[DeviceConfig]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub schema_version: u32,
    pub configs: Vec<DeviceConfig>,
}

pub fn encode_document(configs: &[DeviceConfig]) -> Result<String, StoreError> {
    let document = ConfigDocument {
        schema_version: SCHEMA_VERSION,
        configs: configs.to_vec(),
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Parses and sanitizes a configuration document.
pub fn decode_document(text: &str) -> Result<Vec<DeviceConfig>, StoreError> {
    let value: Value = serde_json::from_str(text)?;
    let object = match value {
        Value::Object(object) => object,
        _ => return Err(StoreError::Unversioned),
    };
    let version = object
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .ok_or(StoreError::Unversioned)?;
    if version == 0 || version > SCHEMA_VERSION as u64 {
        return Err(StoreError::UnsupportedSchema(
            u32::try_from(version).unwrap_or(u32::MAX),
        ));
    }

    let entries = match object.get("configs") {
        Some(Value::Array(entries)) => entries.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(StoreError::Json(serde::de::Error::custom(
                "configs must be an array",
            )))
        }
    };

    let raw = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value::<RawConfig>(entry) {
            Ok(raw) => Some(raw),
            Err(e) => {
                log::warn!("Dropping unreadable display config #{}: {}", index, e);
                None
            }
        })
        .collect();
    Ok(sanitize(raw))
}

/// Lenient shape of a stored config; every field may be missing or wrong.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawConfig {
    id: Option<String>,
    name: Option<String>,
    serial_number: Option<u32>,
    physical_width: Option<u32>,
    physical_height: Option<u32>,
    modes: Option<Vec<RawMode>>,
    desired_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawMode {
    width: Option<u32>,
    height: Option<u32>,
    refresh_rate: Option<f64>,
    #[serde(rename = "hiDPI")]
    hi_dpi: Option<bool>,
}

impl RawMode {
    fn into_mode(self) -> Option<DisplayMode> {
        let mode = DisplayMode::new(self.width?, self.height?, self.refresh_rate?)
            .with_hi_dpi(self.hi_dpi.unwrap_or(false));
        mode.is_valid().then_some(mode)
    }
}

fn sanitize(raw: Vec<RawConfig>) -> Vec<DeviceConfig> {
    // First-seen valid serials are kept; everything else is renumbered
    // afterwards with the smallest free serials, in document order.
    let mut taken = HashSet::new();
    let kept: Vec<Option<u32>> = raw
        .iter()
        .map(|r| r.serial_number.filter(|s| *s != 0 && taken.insert(*s)))
        .collect();

    let mut seen_ids = HashSet::new();
    let mut next_candidate = 1u32;
    let mut configs = Vec::with_capacity(raw.len());

    for (index, (entry, serial)) in raw.into_iter().zip(kept).enumerate() {
        let mut id = entry
            .id
            .as_deref()
            .and_then(ConfigId::parse)
            .unwrap_or_default();
        if !seen_ids.insert(id) {
            log::warn!("Display config #{} reuses id {}, assigning a new one", index, id);
            id = ConfigId::new();
            seen_ids.insert(id);
        }

        let serial_number = match serial {
            Some(serial) => serial,
            None => {
                while taken.contains(&next_candidate) {
                    next_candidate += 1;
                }
                taken.insert(next_candidate);
                log::warn!(
                    "Display config #{} had a missing or colliding serial {:?}, renumbered to {}",
                    index,
                    entry.serial_number,
                    next_candidate
                );
                next_candidate
            }
        };

        let name = entry
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Virtual Display {}", index + 1));

        let mut modes: Vec<DisplayMode> = entry
            .modes
            .unwrap_or_default()
            .into_iter()
            .filter_map(RawMode::into_mode)
            .collect();
        if modes.is_empty() {
            modes.push(DisplayMode::default());
        }

        let (default_width, default_height) = physical_size_for(&modes[0]);
        let (physical_width, physical_height) =
            match (entry.physical_width, entry.physical_height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                _ => (default_width, default_height),
            };

        configs.push(DeviceConfig {
            id,
            name,
            serial_number,
            physical_width,
            physical_height,
            modes,
            desired_enabled: entry.desired_enabled.unwrap_or(false),
        });
    }
    configs
}

/// Stores the configuration document in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigPersistence for JsonFileStore {
    fn load_configs(&self) -> Result<Vec<DeviceConfig>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        decode_document(&text)
    }

    fn save_configs(&self, configs: &[DeviceConfig]) -> Result<(), StoreError> {
        let text = encode_document(configs)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }
}

/// Keeps the document in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: Mutex<Vec<DeviceConfig>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(configs: Vec<DeviceConfig>) -> Self {
        Self {
            configs: Mutex::new(configs),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceConfig> {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigPersistence for MemoryStore {
    fn load_configs(&self) -> Result<Vec<DeviceConfig>, StoreError> {
        Ok(self.snapshot())
    }

    fn save_configs(&self, configs: &[DeviceConfig]) -> Result<(), StoreError> {
        *self.configs.lock().unwrap_or_else(PoisonError::into_inner) = configs.to_vec();
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_round_trip_preserves_fields() {
        let mut a = DeviceConfig::new("Left", 4, DisplayMode::new(2560, 1440, 120.0));
        a.desired_enabled = false;
        a.modes.push(DisplayMode::new(1280, 720, 60.0).with_hi_dpi(true));
        let b = DeviceConfig::new("Right", 5, DisplayMode::default());

        let text = encode_document(&[a.clone(), b.clone()]).unwrap();
        let document: ConfigDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(document.schema_version, SCHEMA_VERSION);

        let decoded = decode_document(&text).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn test_bare_array_is_rejected() {
        let config = DeviceConfig::new("Legacy", 1, DisplayMode::default());
        let text = serde_json::to_string(&vec![config]).unwrap();
        assert!(matches!(decode_document(&text), Err(StoreError::Unversioned)));
    }

    #[test]
    fn test_missing_schema_version_is_rejected() {
        assert!(matches!(
            decode_document(r#"{"configs": []}"#),
            Err(StoreError::Unversioned)
        ));
    }

    #[test]
    fn test_future_schema_version_is_rejected() {
        assert!(matches!(
            decode_document(r#"{"schemaVersion": 7, "configs": []}"#),
            Err(StoreError::UnsupportedSchema(7))
        ));
    }

    #[test]
    fn test_sanitize_renumbers_colliding_serials_first_seen_wins() {
        let text = r#"{
            "schemaVersion": 1,
            "configs": [
                {"name": "A", "serialNumber": 2, "modes": [{"width": 800, "height": 600, "refreshRate": 60}]},
                {"name": "B", "serialNumber": 2, "modes": [{"width": 800, "height": 600, "refreshRate": 60}]},
                {"name": "C", "serialNumber": 0, "modes": [{"width": 800, "height": 600, "refreshRate": 60}]},
                {"name": "D", "serialNumber": 1, "modes": [{"width": 800, "height": 600, "refreshRate": 60}]}
            ]
        }"#;
        let configs = decode_document(text).unwrap();
        let serials: Vec<u32> = configs.iter().map(|c| c.serial_number).collect();
        assert_eq!(serials, vec![2, 3, 4, 1]);
    }

    #[test]
    fn test_sanitize_repairs_invalid_entries() {
        let text = r#"{
            "schemaVersion": 1,
            "configs": [
                {"name": "  ", "serialNumber": 9, "physicalWidth": 0, "modes": [{"width": 0, "height": 600, "refreshRate": 60}]}
            ]
        }"#;
        let configs = decode_document(text).unwrap();
        let config = &configs[0];
        assert_eq!(config.name, "Virtual Display 1");
        assert_eq!(config.modes, vec![DisplayMode::default()]);
        assert_eq!(config.physical_width, 443);
        assert!(!config.desired_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sanitize_deduplicates_ids() {
        let id = ConfigId::new();
        let text = format!(
            r#"{{"schemaVersion": 1, "configs": [
                {{"id": "{id}", "name": "A", "serialNumber": 1}},
                {{"id": "{id}", "name": "B", "serialNumber": 2}}
            ]}}"#
        );
        let configs = decode_document(&text).unwrap();
        assert_eq!(configs[0].id, id);
        assert_ne!(configs[1].id, id);
    }

    #[test]
    fn test_json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("displays.json"));
        assert!(store.load_configs().unwrap().is_empty());

        let config = DeviceConfig::new("Disk", 11, DisplayMode::default());
        store.save_configs(&[config.clone()]).unwrap();
        assert_eq!(store.load_configs().unwrap(), vec![config]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let store = MemoryStore::default();
        store.save_configs(&[]).unwrap();
        store.save_configs(&[]).unwrap();
        assert_eq!(store.save_count(), 2);
    }
}
