//! Tests for the topology checks around enable and disable: main-display
//! safety, stability sampling and repair of unhealthy layouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use virtual_display::sim::SimulatedPlatform;
use virtual_display::{
    ConfigId, CoordinatorSettings, DeviceConfig, DisplayCoordinator, DisplayError, DisplayInfo,
    DisplayMode, MemoryStore, Rect, TopologySnapshot,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn fast_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        termination_timeout_ms: 500,
        offline_timeout_ms: 500,
        offline_poll_interval_ms: 10,
        stability_poll_interval_ms: 10,
        stability_timeout_ms: 200,
        ..CoordinatorSettings::default()
    }
}

/// Builds a coordinator over `sim` with disabled configs for `serials`.
fn coordinator_with(
    sim: &SimulatedPlatform,
    settings: CoordinatorSettings,
    serials: &[u32],
) -> (DisplayCoordinator, Vec<ConfigId>) {
    let configs: Vec<DeviceConfig> = serials
        .iter()
        .map(|serial| {
            let mut config =
                DeviceConfig::new(format!("Display {}", serial), *serial, DisplayMode::default());
            config.desired_enabled = false;
            config
        })
        .collect();
    let ids = configs.iter().map(|c| c.id).collect();
    let store = Arc::new(MemoryStore::new(configs));
    let coordinator = DisplayCoordinator::new(settings, sim.platform(), store).unwrap();
    (coordinator, ids)
}

fn physical_only() -> TopologySnapshot {
    TopologySnapshot {
        main_display_id: 1,
        displays: vec![DisplayInfo {
            id: 1,
            serial_number: 0,
            is_managed_virtual_device: false,
            is_in_mirror_set: false,
            mirror_master_id: None,
            bounds: Rect::new(0, 0, 1920, 1080),
        }],
    }
}

// =============================================================================
// Disable safety
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cannot_disable_only_main_display() {
    let sim = SimulatedPlatform::headless();
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1]);
    coordinator.enable(ids[0]).await.unwrap();

    let result = coordinator.disable(ids[0]).await;

    assert!(matches!(
        result,
        Err(DisplayError::CannotDisableCurrentMainWithoutFallback)
    ));
    assert!(coordinator.is_running(ids[0]));
    assert!(coordinator.config(ids[0]).unwrap().desired_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_second_managed_display_is_a_fallback() {
    let sim = SimulatedPlatform::headless();
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1, 2]);
    coordinator.enable(ids[0]).await.unwrap();
    coordinator.enable(ids[1]).await.unwrap();

    coordinator.check_disable_safety(ids[0]).unwrap();
    coordinator.disable(ids[0]).await.unwrap();

    assert!(!coordinator.is_running(ids[0]));
    assert!(coordinator.is_running(ids[1]));
}

#[tokio::test(start_paused = true)]
async fn test_disabling_non_main_display_is_allowed() {
    let sim = SimulatedPlatform::new();
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1]);
    coordinator.enable(ids[0]).await.unwrap();

    coordinator.disable(ids[0]).await.unwrap();

    assert!(!coordinator.is_running(ids[0]));
}

#[tokio::test(start_paused = true)]
async fn test_disable_refused_when_topology_unavailable() {
    let sim = SimulatedPlatform::new();
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1]);
    coordinator.enable(ids[0]).await.unwrap();
    sim.set_inspector_available(false);

    let result = coordinator.disable(ids[0]).await;

    assert!(matches!(result, Err(DisplayError::DisableSafetyCheckUnavailable)));
    assert!(coordinator.is_running(ids[0]));
}

// =============================================================================
// Stability sampling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_oscillating_topology_fails_enable_without_repair() {
    let sim = SimulatedPlatform::new();
    let mut other = physical_only();
    other.displays[0].bounds = Rect::new(0, 0, 1280, 720);
    sim.script_snapshots(vec![Some(physical_only()), Some(other)], true);
    let settings = fast_settings();
    let deadline = settings.stability_timeout() + settings.stability_poll_interval();
    let (coordinator, ids) = coordinator_with(&sim, settings, &[1]);

    let started = Instant::now();
    let result = coordinator.enable(ids[0]).await;

    assert!(matches!(result, Err(DisplayError::TopologyUnstableAfterEnable)));
    assert!(started.elapsed() <= deadline);
    assert!(sim.repairs().is_empty());
    assert!(!coordinator.is_running(ids[0]));
    assert!(!coordinator.has_live_device(ids[0]));
}

#[tokio::test(start_paused = true)]
async fn test_missing_sample_breaks_stability_streak() {
    let sim = SimulatedPlatform::new();
    sim.script_snapshots(
        vec![
            Some(physical_only()),
            None,
            Some(physical_only()),
            Some(physical_only()),
        ],
        false,
    );
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1]);

    let started = Instant::now();
    coordinator.enable(ids[0]).await.unwrap();

    // Two identical samples after the gap, not around it.
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(coordinator.is_running(ids[0]));
}

// =============================================================================
// Repair
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mirror_collapse_repaired_once_around_main() {
    let sim = SimulatedPlatform::new();
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1, 2]);
    coordinator.enable(ids[0]).await.unwrap();
    let main = coordinator.display_id(ids[0]).unwrap();
    sim.set_main_display(main);
    sim.mirror(2, 1);

    coordinator.enable(ids[1]).await.unwrap();

    let repairs = sim.repairs();
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].anchor_id, main);
    let mut expected = vec![main, coordinator.display_id(ids[1]).unwrap()];
    expected.sort_unstable();
    assert_eq!(repairs[0].managed_ids, expected);
    assert!(coordinator.is_running(ids[1]));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_displays_anchor_on_top_left() {
    let sim = SimulatedPlatform::new();
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1, 2]);
    coordinator.enable(ids[0]).await.unwrap();
    sim.stack_managed_displays(true);

    coordinator.enable(ids[1]).await.unwrap();

    let repairs = sim.repairs();
    assert_eq!(repairs.len(), 1);
    // Main is physical, so the anchor falls to the lowest-id managed display
    // at the shared origin.
    assert_eq!(Some(repairs[0].anchor_id), coordinator.display_id(ids[0]));
}

#[tokio::test(start_paused = true)]
async fn test_failed_repair_rolls_back_enable() {
    let sim = SimulatedPlatform::new();
    let (coordinator, ids) = coordinator_with(&sim, fast_settings(), &[1, 2]);
    coordinator.enable(ids[0]).await.unwrap();
    sim.mirror(2, 1);
    sim.set_repair_result(false);

    let result = coordinator.enable(ids[1]).await;

    assert!(matches!(result, Err(DisplayError::TopologyRepairFailed)));
    assert!(!coordinator.is_running(ids[1]));
    assert!(coordinator.is_running(ids[0]));
}

#[tokio::test(start_paused = true)]
async fn test_preferred_main_serial_wins_anchor() {
    let sim = SimulatedPlatform::new();
    let settings = CoordinatorSettings {
        preferred_main_serial: Some(2),
        ..fast_settings()
    };
    let (coordinator, ids) = coordinator_with(&sim, settings, &[1, 2]);
    coordinator.enable(ids[0]).await.unwrap();
    sim.mirror(2, 1);

    coordinator.enable(ids[1]).await.unwrap();

    let repairs = sim.repairs();
    assert_eq!(repairs.len(), 1);
    assert_eq!(Some(repairs[0].anchor_id), coordinator.display_id(ids[1]));
}

#[tokio::test(start_paused = true)]
async fn test_forced_normalization_repairs_only_when_configured() {
    for (repair_on_forced, expected) in [(false, 0), (true, 1)] {
        let sim = SimulatedPlatform::headless();
        let settings = CoordinatorSettings {
            repair_on_forced_normalization: repair_on_forced,
            ..fast_settings()
        };
        let (coordinator, ids) = coordinator_with(&sim, settings, &[1, 2]);
        coordinator.enable(ids[0]).await.unwrap();
        coordinator.enable(ids[1]).await.unwrap();

        assert_eq!(sim.repairs().len(), expected);
    }
}
