//! Collaborators supplied by the host platform.
//!
//! The coordinator never talks to the OS directly. Each concern sits behind a
//! trait so the lifecycle logic can run against CoreGraphics, a driver IPC
//! channel or the in-process simulator alike.
//!
//! Implementations must never invoke a [`TerminationCallback`] or a
//! reconfiguration handler synchronously from inside one of their own trait
//! methods or from a device's `Drop`; the coordinator may be holding its state
//! lock at those points.

use std::sync::Arc;

use crate::record::{DeviceConfig, DisplayMode};
use crate::topology::TopologySnapshot;

/// Fired once when the OS reports that a device has gone away.
pub type TerminationCallback = Box<dyn FnOnce() + Send + 'static>;

/// Fired on every display topology change.
pub type ReconfigurationHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Identity triple under which a managed display shows up in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagedIdentity {
    pub vendor_id: u32,
    pub product_id: u32,
    pub serial_number: u32,
}

/// Everything the OS needs to register a new virtual display.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub identity: ManagedIdentity,
    pub max_pixels_wide: u32,
    pub max_pixels_high: u32,
    /// Physical size in millimeters.
    pub size_millimeters: (u32, u32),
}

impl DeviceDescriptor {
    pub fn for_config(config: &DeviceConfig, vendor_id: u32, product_id: u32) -> Self {
        let (max_pixels_wide, max_pixels_high) = config.max_pixels();
        Self {
            name: config.name.clone(),
            identity: ManagedIdentity {
                vendor_id,
                product_id,
                serial_number: config.serial_number,
            },
            max_pixels_wide,
            max_pixels_high,
            size_millimeters: (config.physical_width, config.physical_height),
        }
    }
}

/// Modes applied to a freshly created device.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeSettings {
    pub hi_dpi: bool,
    pub modes: Vec<DisplayMode>,
}

impl ModeSettings {
    pub fn for_config(config: &DeviceConfig) -> Self {
        Self {
            hi_dpi: config.modes.iter().any(|m| m.hi_dpi),
            modes: config.modes.clone(),
        }
    }
}

/// A live OS display device. Dropping it starts teardown.
pub trait VirtualDevice: Send {
    /// System display id the device currently appears under.
    fn display_id(&self) -> u32;

    /// Applies modes; `false` means the OS rejected them.
    fn apply(&mut self, settings: &ModeSettings) -> bool;
}

/// Creates virtual display devices.
pub trait DeviceBackend: Send + Sync {
    /// Registers a device. `on_terminated` fires once the OS has torn it down,
    /// however that teardown was triggered.
    fn create_device(
        &self,
        descriptor: &DeviceDescriptor,
        on_terminated: TerminationCallback,
    ) -> Option<Box<dyn VirtualDevice>>;
}

/// Observes the system display topology.
pub trait TopologyInspector: Send + Sync {
    /// Point-in-time view of all displays, or `None` when the topology cannot
    /// be read right now.
    fn snapshot(
        &self,
        tracked_serials: &[u32],
        vendor_id: u32,
        product_id: u32,
    ) -> Option<TopologySnapshot>;

    /// Whether a display with this identity is currently online.
    fn is_display_online(&self, identity: ManagedIdentity) -> bool;
}

/// Re-arranges the topology around an anchor display.
pub trait TopologyRepairer: Send + Sync {
    fn repair(&self, snapshot: &TopologySnapshot, managed_ids: &[u32], anchor_id: u32) -> bool;
}

/// Push notifications for display topology changes.
pub trait ReconfigurationNotifier: Send + Sync {
    /// Returns `false` if the registration was refused.
    fn start(&self, handler: ReconfigurationHandler) -> bool;
    fn stop(&self);
}

/// The full set of platform collaborators the coordinator runs against.
#[derive(Clone)]
pub struct Platform {
    pub backend: Arc<dyn DeviceBackend>,
    pub inspector: Arc<dyn TopologyInspector>,
    pub repairer: Arc<dyn TopologyRepairer>,
    pub notifier: Option<Arc<dyn ReconfigurationNotifier>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_config() {
        let mut config = DeviceConfig::new("Studio", 21, DisplayMode::new(2560, 1440, 60.0));
        config
            .modes
            .push(DisplayMode::new(1920, 1080, 60.0).with_hi_dpi(true));
        let descriptor = DeviceDescriptor::for_config(&config, 0x3456, 0x1234);
        assert_eq!(descriptor.identity.serial_number, 21);
        assert_eq!(descriptor.identity.vendor_id, 0x3456);
        assert_eq!((descriptor.max_pixels_wide, descriptor.max_pixels_high), (3840, 2160));
        assert_eq!(descriptor.size_millimeters, (591, 333));
    }

    #[test]
    fn test_mode_settings_hidpi_when_any_mode_is() {
        let mut config = DeviceConfig::new("Studio", 21, DisplayMode::default());
        assert!(!ModeSettings::for_config(&config).hi_dpi);
        config.modes[0].hi_dpi = true;
        assert!(ModeSettings::for_config(&config).hi_dpi);
    }
}
