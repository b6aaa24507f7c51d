//! Persistence layer for the bundle store

use crate::bundle::ContextBundle;
use crate::error::StorageError;
use crate::types::BundleId;
use std::path::Path;

/// Sled-backed bundle records, keyed by bundle id.
///
/// Values are JSON: bundle payloads are self-describing `serde_json::Value`s,
/// which a non-self-describing codec cannot round-trip.
pub struct SledBundleStore {
    db: sled::Db,
}

impl SledBundleStore {
    /// Open (or create) a store at the given directory.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn get(&self, id: &BundleId) -> Result<Option<ContextBundle>, StorageError> {
        match self.db.get(id.as_str().as_bytes())? {
            Some(value) => {
                let bundle = serde_json::from_slice(&value).map_err(|e| {
                    StorageError::Serialization(format!("Failed to decode bundle {}: {}", id, e))
                })?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }

    pub fn put(&self, bundle: &ContextBundle) -> Result<(), StorageError> {
        let value = serde_json::to_vec(bundle).map_err(|e| {
            StorageError::Serialization(format!("Failed to encode bundle {}: {}", bundle.id, e))
        })?;
        self.db.insert(bundle.id.as_str().as_bytes(), value)?;
        Ok(())
    }

    pub fn contains(&self, id: &BundleId) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(id.as_str().as_bytes())?)
    }

    /// All stored bundles in key order.
    pub fn list_all(&self) -> Result<Vec<ContextBundle>, StorageError> {
        let mut bundles = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item?;
            let bundle: ContextBundle = serde_json::from_slice(&value)
                .map_err(|e| StorageError::Serialization(format!("Failed to decode bundle: {}", e)))?;
            bundles.push(bundle);
        }
        Ok(bundles)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
