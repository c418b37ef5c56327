//! In-memory content-addressed block storage
//!
//! The sync engine talks to storage through the [`LinkStore`] capability set:
//! read a block by CID, or commit a fully buffered block under its CID. Two
//! implementations exist: [`BlockStore`] here, which keeps bytes, and
//! [`crate::count_store::CountStore`], which only counts commits.

use std::collections::HashMap;
use std::sync::Mutex;

use cid::Cid;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block not found: {0}")]
    NotFound(Cid),
}

/// The link-system contract consumed by chain traversal.
pub trait LinkStore: Send + Sync {
    /// Returns the block stored under `cid`, or [`StoreError::NotFound`].
    fn open_read(&self, cid: &Cid) -> Result<Vec<u8>, StoreError>;

    /// Records `data` under `cid`. Idempotent for identical `(cid, data)`.
    fn commit(&self, cid: &Cid, data: &[u8]) -> Result<(), StoreError>;
}

/// CID-keyed in-memory block store.
///
/// With `delete_after_read` set, a successful [`LinkStore::open_read`]
/// removes the entry, bounding memory for one-pass scans such as ad listing.
pub struct BlockStore {
    blocks: Mutex<HashMap<Cid, Vec<u8>>>,
    delete_after_read: bool,
}

impl BlockStore {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            delete_after_read: false,
        }
    }

    pub fn with_delete_after_read() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            delete_after_read: true,
        }
    }

    /// Reads without consuming, regardless of the delete-after-read mode.
    pub fn peek(&self, cid: &Cid) -> Result<Vec<u8>, StoreError> {
        let blocks = self.blocks.lock().expect("block store poisoned");
        blocks.get(cid).cloned().ok_or(StoreError::NotFound(*cid))
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks
            .lock()
            .expect("block store poisoned")
            .contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().expect("block store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops a block, returning its bytes when it was present.
    pub fn remove(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.blocks.lock().expect("block store poisoned").remove(cid)
    }

    pub fn clear(&self) {
        self.blocks.lock().expect("block store poisoned").clear();
        debug!("cleared block store");
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStore for BlockStore {
    fn open_read(&self, cid: &Cid) -> Result<Vec<u8>, StoreError> {
        let mut blocks = self.blocks.lock().expect("block store poisoned");
        if self.delete_after_read {
            blocks.remove(cid).ok_or(StoreError::NotFound(*cid))
        } else {
            blocks.get(cid).cloned().ok_or(StoreError::NotFound(*cid))
        }
    }

    fn commit(&self, cid: &Cid, data: &[u8]) -> Result<(), StoreError> {
        let mut blocks = self.blocks.lock().expect("block store poisoned");
        blocks.insert(*cid, data.to_vec());
        Ok(())
    }
}
