//! Entries iteration
//!
//! A lazy cursor over an advertisement's entry-chunk chain. The iterator
//! only reads the local block store; it never performs network I/O, so
//! draining can be interrupted at any time without aborting a sync.

use std::collections::VecDeque;
use std::sync::Arc;

use cid::Cid;
use multihash::Multihash;
use thiserror::Error;

use crate::schema::{self, SchemaError};
use crate::store::{BlockStore, LinkStore, StoreError};

#[derive(Debug, Error)]
pub enum EntriesError {
    /// The chunk was not synced into the local store.
    #[error("entries chunk not synced: {0}")]
    NotSynced(Cid),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Cursor over the multihashes of one advertisement's entries chain.
pub struct EntriesIterator {
    store: Arc<BlockStore>,
    root: Cid,
    next: Option<Cid>,
    buf: VecDeque<Multihash>,
    chunk_count: usize,
}

impl EntriesIterator {
    pub fn new(root: Cid, store: Arc<BlockStore>) -> Self {
        Self {
            store,
            root,
            next: Some(root),
            buf: VecDeque::new(),
            chunk_count: 0,
        }
    }

    pub fn root(&self) -> Cid {
        self.root
    }

    /// False iff the root is the no-entries sentinel.
    pub fn is_present(&self) -> bool {
        schema::is_entries_present(&self.root)
    }

    /// Number of chunks materialized so far; the total chunk count once
    /// iteration has reached the end of the chain.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Pulls the next multihash, loading the next chunk from the store when
    /// the current one is drained. `Ok(None)` signals the end of the chain.
    pub fn next(&mut self) -> Result<Option<Multihash>, EntriesError> {
        if !self.is_present() {
            return Ok(None);
        }

        loop {
            if let Some(mh) = self.buf.pop_front() {
                return Ok(Some(mh));
            }

            let next = match self.next {
                Some(c) if schema::is_entries_present(&c) => c,
                _ => return Ok(None),
            };

            let data = match self.store.open_read(&next) {
                Ok(data) => data,
                Err(StoreError::NotFound(c)) => return Err(EntriesError::NotSynced(c)),
            };
            let chunk = schema::decode_entry_chunk(&next, &data)?;
            self.next = chunk.next;
            self.buf.extend(chunk.entries);
            self.chunk_count += 1;
        }
    }

    /// Pulls until the end of the chain or the first missing chunk. When the
    /// chain was only partially synced the multihashes read so far are
    /// returned together with the error.
    pub fn drain(&mut self) -> (Vec<Multihash>, Option<EntriesError>) {
        let mut mhs = Vec::new();
        loop {
            match self.next() {
                Ok(Some(mh)) => mhs.push(mh),
                Ok(None) => return (mhs, None),
                Err(e) => return (mhs, Some(e)),
            }
        }
    }
}
