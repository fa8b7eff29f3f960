//! Node storage backends

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Key-value store holding the nodes and the root of one tree
pub trait Storage: Send + Sync {
    /// Value under `key`
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write all entries atomically
    fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;
}

/// Storage inside a sled database, under a key prefix
#[derive(Clone, Debug)]
pub struct SledStorage {
    db: sled::Db,
    prefix: Vec<u8>,
}

impl SledStorage {
    /// Storage rooted at `prefix` in `db`
    pub fn new(db: sled::Db, prefix: &[u8]) -> Self {
        Self { db, prefix: prefix.to_vec() }
    }

    /// Storage in a fresh temporary database, removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::new(db, b""))
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.prefix.len() + key.len());
        k.extend_from_slice(&self.prefix);
        k.extend_from_slice(key);
        k
    }
}

impl Storage for SledStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(self.full_key(key))?.map(|v| v.to_vec()))
    }

    fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (k, v) in entries {
            batch.insert(self.full_key(&k), v);
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }
}

/// In-memory storage
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    map: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut map = self.map.write();
        map.extend(entries);
        Ok(())
    }
}
