use crate::campaign::Campaign;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or writing persisted campaign state.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No campaign has been saved at the store's location yet.
    #[error("No campaign found at {0:?}")]
    NotFound(PathBuf),

    /// An I/O error occurred while reading or writing the backing file.
    #[error("Campaign store I/O error: {0}")]
    Io(String),

    /// The stored campaign could not be encoded or decoded.
    #[error("Campaign store serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(format!("JSON operation error: {}", err))
    }
}

/// Persists and reloads the single active campaign.
///
/// A `save` must be durable before the next `load` observes it; the injector
/// relies on this to avoid losing progress on a crash right after an injection.
pub trait CampaignStore: Send + Sync {
    /// Reads the stored campaign.
    ///
    /// # Returns
    /// `Result<Campaign, StoreError>`:
    ///   - `Ok(campaign)`: The last campaign saved, possibly edited by an operator since.
    ///   - `Err(StoreError::NotFound)`: If nothing has been saved yet.
    ///   - `Err(error)`: If the backing storage could not be read or decoded.
    fn load(&self) -> Result<Campaign, StoreError>;

    /// Replaces the stored campaign.
    ///
    /// # Arguments
    /// * `campaign`: The full campaign state, configuration and progress alike.
    ///
    /// # Returns
    /// `Ok(())` once the write is durable, or the `StoreError` that prevented it.
    fn save(&self, campaign: &Campaign) -> Result<(), StoreError>;

    /// Loads the stored campaign, or the uninitialized default if none exists.
    fn load_or_default(&self) -> Result<Campaign, StoreError> {
        match self.load() {
            Err(StoreError::NotFound(_)) => Ok(Campaign::default()),
            other => other,
        }
    }
}

/// Stores the campaign as pretty-printed JSON in a single file.
///
/// Writes go to a temporary file in the same directory which is then renamed over
/// the target, so a reader never sees a half-written campaign.
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

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl CampaignStore for JsonFileStore {
    fn load(&self) -> Result<Campaign, StoreError> {
        if !self.path.is_file() {
            return Err(StoreError::NotFound(self.path.clone()));
        }
        let file = File::open(&self.path).map_err(|e| {
            StoreError::Io(format!("Failed to open campaign file {:?}: {}", self.path, e))
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| {
            StoreError::Serialization(format!(
                "Failed to parse campaign JSON from {:?}: {}. The file might be corrupted.",
                self.path, e
            ))
        })
    }

    fn save(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Io(format!("Failed to create store directory {:?}: {}", dir, e))
        })?;

        let temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| {
            StoreError::Io(format!("Failed to create temp file in {:?}: {}", dir, e))
        })?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, campaign)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| {
            StoreError::Io(format!(
                "Failed to move campaign into place at {:?}: {}",
                self.path, e.error
            ))
        })?;
        Ok(())
    }
}

/// Keeps the campaign in memory only. Used by hosts that manage persistence
/// themselves and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    campaign: Mutex<Option<Campaign>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_campaign(campaign: Campaign) -> Self {
        Self {
            campaign: Mutex::new(Some(campaign)),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    /// Replaces the stored campaign without counting as a save, standing in for
    /// an operator editing the store from another process.
    pub fn overwrite(&self, campaign: Campaign) {
        *self.campaign.lock() = Some(campaign);
    }
}

impl CampaignStore for MemoryStore {
    fn load(&self) -> Result<Campaign, StoreError> {
        self.campaign
            .lock()
            .clone()
            .ok_or_else(|| StoreError::NotFound(PathBuf::from("<memory>")))
    }

    fn save(&self, campaign: &Campaign) -> Result<(), StoreError> {
        *self.campaign.lock() = Some(campaign.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{CampaignBuilder, PhaseGoal};

    fn sample_campaign() -> Campaign {
        CampaignBuilder::new(PhaseGoal::BitCount { target: 5 })
            .rates(vec![0.1, 0.01])
            .build()
            .unwrap()
    }

    #[test]
    fn json_store_round_trips_campaign() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("campaign.json"));
        let mut campaign = sample_campaign();
        campaign.phase_counter = 3;

        store.save(&campaign).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, campaign);
    }

    #[test]
    fn json_store_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load(), Err(StoreError::NotFound(_))));
        let fallback = store.load_or_default().unwrap();
        assert!(!fallback.initialized);
    }

    #[test]
    fn json_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("campaign.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Serialization(_))));
        assert!(store.load_or_default().is_err());
    }

    #[test]
    fn json_store_save_overwrites_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("campaign.json"));
        let mut campaign = sample_campaign();
        store.save(&campaign).unwrap();
        campaign.rate_index = 1;
        store.save(&campaign).unwrap();
        assert_eq!(store.load().unwrap().rate_index, 1);
    }

    #[test]
    fn json_store_surfaces_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"a file, not a directory").unwrap();
        let store = JsonFileStore::new(blocker.join("campaign.json"));
        assert!(matches!(
            store.save(&sample_campaign()),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryStore::new();
        assert!(matches!(store.load(), Err(StoreError::NotFound(_))));
        store.save(&sample_campaign()).unwrap();
        store.save(&sample_campaign()).unwrap();
        assert_eq!(store.save_count(), 2);
        assert!(store.load().unwrap().initialized);
    }
}
