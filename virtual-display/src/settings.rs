use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the lifecycle coordinator. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorSettings {
    pub vendor_id: u32,
    pub product_id: u32,
    pub termination_timeout_ms: u64,
    pub offline_timeout_ms: u64,
    pub offline_poll_interval_ms: u64,
    pub stability_poll_interval_ms: u64,
    pub stability_timeout_ms: u64,
    /// Serial of the managed display to keep as main when repairing.
    pub preferred_main_serial: Option<u32>,
    /// Repair a healthy topology when it has no physical fallback and two or
    /// more managed displays are desired.
    pub repair_on_forced_normalization: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x3456,
            product_id: 0x1234,
            termination_timeout_ms: 2_000,
            offline_timeout_ms: 3_000,
            offline_poll_interval_ms: 100,
            stability_poll_interval_ms: 250,
            stability_timeout_ms: 4_000,
            preferred_main_serial: None,
            repair_on_forced_normalization: false,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_timeout_ms)
    }

    pub fn offline_poll_interval(&self) -> Duration {
        Duration::from_millis(self.offline_poll_interval_ms.max(1))
    }

    pub fn stability_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stability_poll_interval_ms.max(1))
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }
}
