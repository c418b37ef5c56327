//! Block-counting store
//!
//! Distance queries may traverse tens of thousands of advertisements in a
//! single pass. This store discards block bytes and counts commits instead,
//! keeping only the most recent block so the traversal can re-read the node
//! it just wrote.

use std::sync::Mutex;

use cid::Cid;

use crate::store::{LinkStore, StoreError};

#[derive(Default)]
struct Inner {
    count: u64,
    last: Option<(Cid, Vec<u8>)>,
}

/// A [`LinkStore`] that counts committed blocks without retaining them.
#[derive(Default)]
pub struct CountStore {
    inner: Mutex<Inner>,
}

impl CountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks committed so far.
    pub fn count(&self) -> u64 {
        self.inner.lock().expect("count store poisoned").count
    }

    /// Returns the count and resets the store for reuse.
    pub fn take(&self) -> u64 {
        let mut inner = self.inner.lock().expect("count store poisoned");
        let count = inner.count;
        inner.count = 0;
        inner.last = None;
        count
    }
}

impl LinkStore for CountStore {
    fn open_read(&self, cid: &Cid) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock().expect("count store poisoned");
        match &inner.last {
            Some((last_cid, data)) if last_cid == cid => Ok(data.clone()),
            _ => Err(StoreError::NotFound(*cid)),
        }
    }

    fn commit(&self, cid: &Cid, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("count store poisoned");
        inner.count += 1;
        inner.last = Some((*cid, data.to_vec()));
        Ok(())
    }
}
