use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::errors::{HarnessError, Result};

/// Serial actuator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port to probe before enumerating, e.g. `/dev/rfcomm0` or `COM5`.
    pub port_name: Option<String>,
    /// Kill switch: no port is ever opened.
    pub disabled: bool,
    /// Run the channel on a background thread.
    pub worker: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub subject_id: String,
    /// Results land in `<results_dir>/<data_label>.csv`.
    pub data_label: String,
    pub results_dir: PathBuf,
    /// Trials recorded per block.
    pub iterations: usize,
    /// Slider value that completes a trial.
    pub slider_target: f64,
    /// Slider must rest this long on the target before the trial commits.
    pub reselect_interval_ms: u64,
    /// Contacts from objects with this tag commit the trial.
    pub contact_tag: String,
    pub slot_count: usize,
    /// Delay between an advance request and the slot change.
    pub advance_delay_ms: u64,
    pub advance_on_completion: bool,
    pub reset_on_completion: bool,
    pub serial: SerialSettings,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            subject_id: "anonymous".into(),
            data_label: "results".into(),
            results_dir: PathBuf::from("results"),
            iterations: 10,
            slider_target: 0.0,
            reselect_interval_ms: 100,
            contact_tag: "Cube".into(),
            slot_count: 1,
            advance_delay_ms: 100,
            advance_on_completion: true,
            reset_on_completion: true,
            serial: SerialSettings::default(),
        }
    }
}

impl ExperimentConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(HarnessError::Config("slot_count must be at least 1".into()));
        }
        if self.data_label.trim().is_empty() {
            return Err(HarnessError::Config("data_label must not be empty".into()));
        }
        Ok(())
    }

    pub fn reselect_interval(&self) -> Duration {
        Duration::from_millis(self.reselect_interval_ms)
    }

    pub fn advance_delay(&self) -> Duration {
        Duration::from_millis(self.advance_delay_ms)
    }
}
