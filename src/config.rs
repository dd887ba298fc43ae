//! Persistent settings: process-wide tuning plus named offset profiles.

use crate::step::{StepConfig, MAX_STEP_WINDOW};
use crate::types::{DeviceOffsets, OffsetUpdate, Toggle, VelAccMode};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Named set of device offsets a client can apply to any device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default)]
    pub offsets_enabled: bool,
    #[serde(default)]
    pub offsets: DeviceOffsets,
}

impl DeviceProfile {
    pub fn from_offsets(name: &str, offsets_enabled: bool, offsets: DeviceOffsets) -> Self {
        Self {
            name: name.to_string(),
            offsets_enabled,
            offsets,
        }
    }

    /// The request that applies this profile: Set all six fields.
    pub fn to_update(&self) -> (Toggle, OffsetUpdate) {
        (
            Toggle::from_bool(self.offsets_enabled),
            OffsetUpdate::all(self.offsets),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub vel_acc_compensation_mode: VelAccMode,

    #[serde(default)]
    pub step_detection_enabled: bool,

    #[serde(default)]
    pub step_detection: StepConfig,

    #[serde(default)]
    pub profiles: Vec<DeviceProfile>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vel_acc_compensation_mode: VelAccMode::Disabled,
            step_detection_enabled: false,
            step_detection: StepConfig::default(),
            profiles: Vec::new(),
        }
    }
}

impl Settings {
    /// Read settings from a JSON file and clamp them into range.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut settings: Settings = serde_json::from_str(&contents)?;
        settings.validate();
        log::info!(
            "Settings loaded from {} ({} profiles)",
            path.display(),
            settings.profiles.len()
        );
        Ok(settings)
    }

    /// Like [`Settings::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        log::debug!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Replace out-of-range tuning with defaults and drop unnamed profiles.
    pub fn validate(&mut self) {
        let defaults = StepConfig::default();
        let step = &mut self.step_detection;
        if step.window > MAX_STEP_WINDOW {
            step.window = MAX_STEP_WINDOW;
        }
        if !StepConfig::is_valid_window(step.window) {
            step.window = defaults.window;
        }
        if !StepConfig::is_valid_threshold(step.jog_threshold) {
            step.jog_threshold = defaults.jog_threshold;
        }
        if !StepConfig::is_valid_threshold(step.run_threshold) {
            step.run_threshold = defaults.run_threshold;
        }
        for (value, default) in step
            .hmd_threshold
            .iter_mut()
            .zip(defaults.hmd_threshold.iter())
        {
            if !StepConfig::is_valid_threshold(*value) {
                *value = *default;
            }
        }
        let before = self.profiles.len();
        self.profiles.retain(|p| !p.name.trim().is_empty());
        if self.profiles.len() != before {
            log::warn!("Dropped {} unnamed profiles", before - self.profiles.len());
        }
    }

    pub fn profile(&self, name: &str) -> Option<&DeviceProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Store `profile`, replacing one with the same name.
    pub fn add_profile(&mut self, profile: DeviceProfile) {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn remove_profile(&mut self, index: usize) -> Option<DeviceProfile> {
        (index < self.profiles.len()).then(|| self.profiles.remove(index))
    }
}
