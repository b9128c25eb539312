use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DisplayError;

/// Stable identity of a display configuration, kept across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(Uuid);

impl ConfigId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(input: &str) -> Option<Self> {
        Uuid::parse_str(input).ok().map(Self)
    }
}

impl Default for ConfigId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One resolution a virtual display advertises.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: f64,
    #[serde(rename = "hiDPI")]
    pub hi_dpi: bool,
}

impl DisplayMode {
    pub fn new(width: u32, height: u32, refresh_rate: f64) -> Self {
        Self {
            width,
            height,
            refresh_rate,
            hi_dpi: false,
        }
    }

    pub fn with_hi_dpi(mut self, hi_dpi: bool) -> Self {
        self.hi_dpi = hi_dpi;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.refresh_rate.is_finite() && self.refresh_rate > 0.0
    }
}

impl Default for DisplayMode {
    fn default() -> Self {
        Self::new(1920, 1080, 60.0)
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}Hz", self.width, self.height, self.refresh_rate)?;
        if self.hi_dpi {
            write!(f, " HiDPI")?;
        }
        Ok(())
    }
}

/// Durable record describing one managed virtual display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: ConfigId,
    pub name: String,
    pub serial_number: u32,
    /// Physical size in millimeters.
    pub physical_width: u32,
    pub physical_height: u32,
    pub modes: Vec<DisplayMode>,
    pub desired_enabled: bool,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, serial_number: u32, mode: DisplayMode) -> Self {
        let (physical_width, physical_height) = physical_size_for(&mode);
        Self {
            id: ConfigId::new(),
            name: name.into(),
            serial_number,
            physical_width,
            physical_height,
            modes: vec![mode],
            desired_enabled: true,
        }
    }

    /// Checks the record can be handed to the device backend.
    pub fn validate(&self) -> Result<(), DisplayError> {
        if self.modes.is_empty() {
            return Err(DisplayError::InvalidConfiguration(format!(
                "display \"{}\" has no modes",
                self.name
            )));
        }
        if let Some(mode) = self.modes.iter().find(|m| !m.is_valid()) {
            return Err(DisplayError::InvalidConfiguration(format!(
                "display \"{}\" has an unusable mode {}",
                self.name, mode
            )));
        }
        if self.serial_number == 0 {
            return Err(DisplayError::InvalidConfiguration(
                "serial number must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Largest pixel extent over all modes, used as the descriptor maximum.
    pub fn max_pixels(&self) -> (u32, u32) {
        self.modes.iter().fold((0, 0), |(w, h), m| {
            let scale = if m.hi_dpi { 2 } else { 1 };
            (
                w.max(m.width.saturating_mul(scale)),
                h.max(m.height.saturating_mul(scale)),
            )
        })
    }
}

/// Physical size of a panel showing `mode` at roughly 110 pixels per inch.
pub(crate) fn physical_size_for(mode: &DisplayMode) -> (u32, u32) {
    const PIXELS_PER_MM: f64 = 110.0 / 25.4;
    (
        (mode.width as f64 / PIXELS_PER_MM).round() as u32,
        (mode.height as f64 / PIXELS_PER_MM).round() as u32,
    )
}
