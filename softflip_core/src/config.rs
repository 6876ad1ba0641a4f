use crate::mutator::TrialKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

pub fn default_store_path() -> PathBuf {
    PathBuf::from("./.softflip/campaign.json")
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReporterSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl ReporterSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InjectorSettings {
    #[serde(default)]
    pub trial: TrialKind,
    /// Fixed RNG seed; a fresh random seed is drawn when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Re-read control flags from the store before every injection.
    #[serde(default = "default_poll_controls")]
    pub poll_controls: bool,
}

fn default_poll_controls() -> bool {
    true
}

impl Default for InjectorSettings {
    fn default() -> Self {
        Self {
            trial: TrialKind::default(),
            seed: None,
            poll_controls: default_poll_controls(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SoftflipSettings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub reporter: ReporterSettings,
    #[serde(default)]
    pub injector: InjectorSettings,
}

impl SoftflipSettings {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read settings file at {:?}: {}", path, e))?;

        let settings: SoftflipSettings = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from settings file {:?}: {}", path, e)
        })?;

        Ok(settings)
    }
}
