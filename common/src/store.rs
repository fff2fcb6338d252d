use std::sync::{Arc, Mutex};

use log::{info, warn};
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::layout;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(String),
    #[error("stored block is truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("stored block checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("stored schema version {stored} does not match {expected}")]
    VersionMismatch { stored: u8, expected: u8 },
    #[error("stored {field} does not match this build")]
    LayoutMismatch { field: &'static str },
    #[error("stored block is corrupt: {0}")]
    Corrupt(&'static str),
}

/// A single persisted block, replaced atomically on every write.
pub trait BlockStorage {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    block: Option<Vec<u8>>,
    fail_reads: bool,
    fail_writes: bool,
    tear_next_write: Option<usize>,
    writes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(block: Vec<u8>) -> Self {
        let storage = Self::default();
        storage.set_block(Some(block));
        storage
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn block(&self) -> Option<Vec<u8>> {
        self.with_state(|state| state.block.clone())
    }

    pub fn set_block(&self, block: Option<Vec<u8>>) {
        self.with_state(|state| state.block = block);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.with_state(|state| state.fail_reads = fail);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.with_state(|state| state.fail_writes = fail);
    }

    pub fn tear_next_write(&self, keep: usize) {
        self.with_state(|state| state.tear_next_write = Some(keep));
    }

    pub fn write_count(&self) -> usize {
        self.with_state(|state| state.writes)
    }
}

impl BlockStorage for MemoryStorage {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        self.with_state(|state| {
            if state.fail_reads {
                return Err(StorageError::Io("injected read failure".to_string()));
            }
            Ok(state.block.clone())
        })
    }

    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError> {
        self.with_state(|state| {
            if state.fail_writes {
                return Err(StorageError::Io("injected write failure".to_string()));
            }
            state.writes += 1;
            if let Some(keep) = state.tear_next_write.take() {
                state.block = Some(block[..keep.min(block.len())].to_vec());
                return Err(StorageError::Io("write torn".to_string()));
            }
            state.block = Some(block.to_vec());
            Ok(())
        })
    }
}

/// Load, save and factory reset of the device record over a [`BlockStorage`].
pub struct ConfigStore<S> {
    storage: S,
    defaults: DeviceConfig,
}

impl<S: BlockStorage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self::with_defaults(storage, DeviceConfig::default())
    }

    pub fn with_defaults(storage: S, defaults: DeviceConfig) -> Self {
        Self { storage, defaults }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Never fails: anything that cannot be read back as a current record is
    /// replaced by the defaults, which are persisted before returning.
    pub fn load(&mut self) -> DeviceConfig {
        match self.storage.read_block() {
            Ok(Some(block)) => match layout::decode(&block, &self.defaults) {
                Ok(config) => {
                    if block.len() != layout::RECORD_LEN {
                        info!("stored config is from an older layout; rewriting");
                        if let Err(err) = self.save(&config) {
                            warn!("failed to rewrite upgraded config: {err}");
                        }
                    }
                    return config;
                }
                Err(err) => {
                    warn!(
                        "stored config unreadable (version {:?}): {err}; restoring defaults",
                        layout::stored_version(&block)
                    );
                }
            },
            Ok(None) => info!("no stored config; writing defaults"),
            Err(err) => warn!("failed to read stored config: {err}; using defaults"),
        }

        self.persist_defaults()
    }

    pub fn save(&mut self, config: &DeviceConfig) -> Result<(), StorageError> {
        self.storage.write_block(&layout::encode(config))
    }

    pub fn reset(&mut self) -> DeviceConfig {
        info!("factory reset of stored config");
        self.persist_defaults()
    }

    fn persist_defaults(&mut self) -> DeviceConfig {
        let defaults = self.defaults.clone();
        if let Err(err) = self.save(&defaults) {
            warn!("failed to persist default config: {err}");
        }
        defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigUpdate, DEFAULT_NAME};
    use pretty_assertions::assert_eq;

    fn custom_config() -> DeviceConfig {
        ConfigUpdate {
            name: Some("desk".to_string()),
            brightness: Some(12),
            ..Default::default()
        }
        .apply_to(&DeviceConfig::default())
    }

    #[test]
    fn empty_storage_loads_and_persists_defaults() {
        let storage = MemoryStorage::new();
        let mut store = ConfigStore::new(storage.clone());

        let config = store.load();

        assert_eq!(config, DeviceConfig::default());
        assert_eq!(
            storage.block(),
            Some(layout::encode(&DeviceConfig::default()).to_vec())
        );
    }

    #[test]
    fn current_record_loads_unchanged() {
        let config = custom_config();
        let storage = MemoryStorage::with_block(layout::encode(&config).to_vec());
        let mut store = ConfigStore::new(storage.clone());

        assert_eq!(store.load(), config);
        assert_eq!(storage.write_count(), 0);
    }

    #[test]
    fn foreign_version_is_replaced_by_defaults() {
        let mut stale = custom_config();
        stale.schema_version = 255;
        let storage = MemoryStorage::with_block(layout::encode(&stale).to_vec());
        let mut store = ConfigStore::new(storage.clone());

        let first = store.load();
        assert_eq!(first.name.as_str(), DEFAULT_NAME);
        assert_eq!(first, DeviceConfig::default());

        let second = store.load();
        assert_eq!(second, first);
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn torn_write_degrades_to_defaults() {
        let storage = MemoryStorage::new();
        let mut store = ConfigStore::new(storage.clone());

        storage.tear_next_write(100);
        assert!(store.save(&custom_config()).is_err());
        assert_eq!(storage.block().map(|block| block.len()), Some(100));

        assert_eq!(store.load(), DeviceConfig::default());
    }

    #[test]
    fn garbage_and_read_failures_degrade_to_defaults() {
        let storage = MemoryStorage::with_block(vec![0xAB; 17]);
        let mut store = ConfigStore::new(storage.clone());
        assert_eq!(store.load(), DeviceConfig::default());

        store.save(&custom_config()).unwrap();
        storage.fail_reads(true);
        assert_eq!(store.load(), DeviceConfig::default());
    }

    #[test]
    fn write_failure_still_yields_defaults() {
        let storage = MemoryStorage::new();
        storage.fail_writes(true);
        let mut store = ConfigStore::new(storage.clone());

        assert_eq!(store.load(), DeviceConfig::default());
        assert_eq!(storage.block(), None);
        assert_eq!(
            store.save(&custom_config()),
            Err(StorageError::Io("injected write failure".to_string()))
        );
    }

    #[test]
    fn reset_overwrites_custom_record() {
        let storage = MemoryStorage::with_block(layout::encode(&custom_config()).to_vec());
        let mut store = ConfigStore::new(storage.clone());
        assert_eq!(store.load(), custom_config());

        assert_eq!(store.reset(), DeviceConfig::default());
        assert_eq!(store.load(), DeviceConfig::default());
    }
}
