use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use virtual_display::sim::SimulatedPlatform;
use virtual_display::{
    native_platform, ConfigId, ConfigPersistence, ConfigStore, CoordinatorSettings, DeviceConfig,
    DisplayCoordinator, DisplayMode, JsonFileStore, LifecyclePhase,
};

use crate::{Cli, Command};

const STORE_FILE: &str = "displays.json";

pub fn default_store_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|dir| dir.join("vdisplay").join(STORE_FILE))
        .unwrap_or_else(|| PathBuf::from(STORE_FILE))
}

pub fn load_settings(path: Option<&Path>) -> Result<CoordinatorSettings> {
    let Some(path) = path else {
        return Ok(CoordinatorSettings::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    CoordinatorSettings::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DisplayStatus<'a> {
    id: String,
    name: &'a str,
    serial_number: u32,
    modes: Vec<String>,
    desired_enabled: bool,
}

fn resolve_id(store: &ConfigStore, input: &str) -> Result<ConfigId> {
    if let Some(id) = ConfigId::parse(input) {
        if store.contains(id) {
            return Ok(id);
        }
    }
    let matches: Vec<ConfigId> = store
        .configs()
        .iter()
        .filter(|c| c.name == input || c.id.to_string().starts_with(input))
        .map(|c| c.id)
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(anyhow!("no display matches \"{}\"", input)),
        _ => Err(anyhow!("\"{}\" matches {} displays", input, matches.len())),
    }
}

pub async fn execute(cli: Cli) -> Result<()> {
    let store_path = cli.store.clone().unwrap_or_else(default_store_path);
    let persistence = JsonFileStore::new(&store_path);
    log::debug!("Using display store {}", store_path.display());

    match cli.command {
        Command::List { json } => {
            let store = ConfigStore::new(persistence.load_configs()?);
            list(&store, json)
        }
        Command::Add {
            name,
            width,
            height,
            refresh,
            hidpi,
            serial,
            disabled,
        } => {
            let mut store = ConfigStore::new(persistence.load_configs()?);
            let serial = serial.unwrap_or_else(|| store.next_free_serial());
            let mut config = DeviceConfig::new(
                name,
                serial,
                DisplayMode::new(width, height, refresh).with_hi_dpi(hidpi),
            );
            config.desired_enabled = !disabled;
            let id = config.id;
            store.insert(config)?;
            persistence.save_configs(store.configs())?;
            log::info!("Added display {} with serial {}", id, serial);
            println!("{}", id);
            Ok(())
        }
        Command::Remove { id } => {
            let mut store = ConfigStore::new(persistence.load_configs()?);
            let id = resolve_id(&store, &id)?;
            store.remove(id);
            persistence.save_configs(store.configs())?;
            log::info!("Removed display {}", id);
            Ok(())
        }
        Command::SetEnabled { id, enabled } => {
            let mut store = ConfigStore::new(persistence.load_configs()?);
            let id = resolve_id(&store, &id)?;
            store.set_desired_enabled(id, enabled);
            persistence.save_configs(store.configs())?;
            log::info!("Display {} desired enabled: {}", id, enabled);
            Ok(())
        }
        Command::Run { simulate } => {
            let settings = load_settings(cli.settings.as_deref())?;
            run(settings, Arc::new(persistence), simulate).await
        }
    }
}

fn list(store: &ConfigStore, json: bool) -> Result<()> {
    let statuses: Vec<DisplayStatus> = store
        .configs()
        .iter()
        .map(|c| DisplayStatus {
            id: c.id.to_string(),
            name: &c.name,
            serial_number: c.serial_number,
            modes: c.modes.iter().map(ToString::to_string).collect(),
            desired_enabled: c.desired_enabled,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    for s in statuses {
        println!(
            "{} {:>4} {:<8} {} [{}]",
            s.id,
            s.serial_number,
            if s.desired_enabled { "enabled" } else { "disabled" },
            s.name,
            s.modes.join(", ")
        );
    }
    Ok(())
}

async fn run(
    settings: CoordinatorSettings,
    persistence: Arc<dyn ConfigPersistence>,
    simulate: bool,
) -> Result<()> {
    let platform = match (simulate, native_platform()) {
        (false, Some(platform)) => platform,
        (false, None) => bail!("no virtual display backend on this host, try --simulate"),
        (true, _) => {
            log::info!("Running against the display simulator");
            SimulatedPlatform::new().platform()
        }
    };

    let coordinator = DisplayCoordinator::new(settings, platform, persistence)?;
    log::info!("Offline confirmation via {:?}", coordinator.offline_mode());

    let failures = coordinator.restore_desired().await;
    for config in coordinator.configs() {
        let phase = coordinator.phase(config.id);
        match coordinator.display_id(config.id) {
            Some(display_id) if phase == LifecyclePhase::Running => {
                log::info!("\"{}\" is display {}", config.name, display_id)
            }
            _ => log::info!("\"{}\" is {:?}", config.name, phase),
        }
    }
    if !failures.is_empty() {
        log::warn!("{} display(s) failed to start", failures.len());
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    log::info!("Interrupted, releasing displays");
    coordinator.shutdown();
    Ok(())
}
