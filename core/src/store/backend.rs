// Persistent record storage for configuration, parameters and version data

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::platform::{FW_VERSION_ID, PROTOCOL_NUMBER};

/// Errors for persistent storage
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Corrupt {key} record: {reason}")]
    Corrupt { key: RecordKey, reason: String },
}

/// The records the node keeps across resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Configuration,
    Params,
    Version,
}

impl RecordKey {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            RecordKey::Configuration => b"cfg",
            RecordKey::Params => b"prm",
            RecordKey::Version => b"ver",
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Configuration => write!(f, "configuration"),
            RecordKey::Params => write!(f, "params"),
            RecordKey::Version => write!(f, "version"),
        }
    }
}

/// Enrolment data written by provisioning
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Configuration {
    pub node_id: u32,
    /// P-256 scalar, 32 bytes big-endian
    pub private_key: Vec<u8>,
    /// Peer verification key, raw `x || y`
    pub peer_public_key: Vec<u8>,
}

impl Configuration {
    /// Address carried by maintenance advertisements
    pub fn short_node_id(&self) -> u16 {
        self.node_id as u16
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.private_key.len() != 32 {
            return Err(StoreError::Corrupt {
                key: RecordKey::Configuration,
                reason: format!("private key is {} bytes", self.private_key.len()),
            });
        }
        if self.peer_public_key.len() != 64 {
            return Err(StoreError::Corrupt {
                key: RecordKey::Configuration,
                reason: format!("peer key is {} bytes", self.peer_public_key.len()),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("node_id", &self.node_id)
            .field("private_key", &"<redacted>")
            .field("peer_public_key", &hex::encode(&self.peer_public_key))
            .finish()
    }
}

/// Runtime-adjustable parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Advertisements at or below this RSSI are ignored
    pub rssi_lower_limit: i8,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            rssi_lower_limit: i8::MIN,
        }
    }
}

/// Firmware identity recorded at the last boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub protocol_id: u8,
    pub fw_id: u16,
}

impl VersionRecord {
    pub fn current() -> Self {
        Self {
            protocol_id: PROTOCOL_NUMBER,
            fw_id: FW_VERSION_ID,
        }
    }
}

/// Blob storage contract required by the engine.
/// Every call is expected to be idempotent.
#[cfg_attr(test, mockall::automock)]
pub trait PersistentStore {
    fn load(&self, key: RecordKey) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&mut self, key: RecordKey, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&mut self, key: RecordKey) -> Result<(), StoreError>;
    /// Wipe the whole storage region
    fn erase_all(&mut self) -> Result<(), StoreError>;
}

/// Typed access to the node records
pub trait RecordsExt: PersistentStore {
    fn load_record<T: DeserializeOwned>(&self, key: RecordKey) -> Result<Option<T>, StoreError> {
        match self.load(key)? {
            None => Ok(None),
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
        }
    }

    fn write_record<T: Serialize>(&mut self, key: RecordKey, value: &T) -> Result<(), StoreError> {
        let bytes =
            bincode::serialize(value).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        self.write(key, &bytes)
    }

    fn load_config(&self) -> Result<Option<Configuration>, StoreError> {
        let config: Option<Configuration> = self.load_record(RecordKey::Configuration)?;
        if let Some(config) = &config {
            config.validate()?;
        }
        Ok(config)
    }

    fn write_config(&mut self, config: &Configuration) -> Result<(), StoreError> {
        config.validate()?;
        self.write_record(RecordKey::Configuration, config)
    }

    fn load_params(&self) -> Result<Option<Params>, StoreError> {
        self.load_record(RecordKey::Params)
    }

    fn write_params(&mut self, params: &Params) -> Result<(), StoreError> {
        self.write_record(RecordKey::Params, params)
    }

    fn load_version(&self) -> Result<Option<VersionRecord>, StoreError> {
        self.load_record(RecordKey::Version)
    }

    fn write_version(&mut self, version: &VersionRecord) -> Result<(), StoreError> {
        self.write_record(RecordKey::Version, version)
    }
}

impl<T: PersistentStore + ?Sized> RecordsExt for T {}

/// In-memory store for tests and simulation
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: HashMap<RecordKey, Vec<u8>>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write fail
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn contains(&self, key: RecordKey) -> bool {
        self.records.contains_key(&key)
    }
}

impl PersistentStore for MemoryStore {
    fn load(&self, key: RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.get(&key).cloned())
    }

    fn write(&mut self, key: RecordKey, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::WriteFailed(format!("{} write rejected", key)));
        }
        self.records.insert(key, value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: RecordKey) -> Result<(), StoreError> {
        self.records.remove(&key);
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.records.clear();
        Ok(())
    }
}

/// sled-backed store for host builds
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl PersistentStore for SledStore {
    fn load(&self, key: RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn write(&mut self, key: RecordKey, value: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn delete(&mut self, key: RecordKey) -> Result<(), StoreError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.db
            .clear()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
