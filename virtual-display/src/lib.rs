// src/lib.rs

mod coordinator;
mod error;
mod persist;
mod platform;
mod record;
mod registry;
mod retry;
mod settings;
pub mod sim;
mod stability;
mod store;
mod teardown;
mod topology;
mod waiter;

#[cfg(target_os = "macos")]
mod macos_impl;

pub use coordinator::{DisplayCoordinator, LifecyclePhase};
pub use error::{DisplayError, StoreError};
pub use persist::{ConfigPersistence, JsonFileStore, MemoryStore, SCHEMA_VERSION};
pub use platform::{
    DeviceBackend, DeviceDescriptor, ManagedIdentity, ModeSettings, Platform,
    ReconfigurationHandler, ReconfigurationNotifier, TerminationCallback, TopologyInspector,
    TopologyRepairer, VirtualDevice,
};
pub use record::{ConfigId, DeviceConfig, DisplayMode};
pub use retry::{Backoff, RetryPolicy};
pub use settings::CoordinatorSettings;
pub use store::ConfigStore;
pub use teardown::OfflineMode;
pub use topology::{
    evaluate, select_anchor, DisplayInfo, Rect, TopologyEvaluation, TopologyIssue,
    TopologySignature, TopologySnapshot,
};

/// The OS display backend for this host, if there is one.
#[cfg(target_os = "macos")]
pub fn native_platform() -> Option<Platform> {
    Some(macos_impl::platform())
}

// Non-macOS stub
#[cfg(not(target_os = "macos"))]
pub fn native_platform() -> Option<Platform> {
    log::warn!("Virtual displays are only supported on macOS.");
    None
}
