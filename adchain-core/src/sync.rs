//! Chain traversal
//!
//! Advertisement chains and entry-chunk chains are both singly linked lists
//! of content-addressed blocks, differing only in which field carries the
//! link. A walk is described by a [`Selector`] and executed against any
//! [`LinkStore`]: blocks already present locally are not fetched again, and
//! every fetched block is verified against its CID before being committed.

use cid::Cid;
use thiserror::Error;
use tracing::trace;

use crate::fetch::{FetchError, Fetcher};
use crate::schema::{self, SchemaError};
use crate::store::{LinkStore, StoreError};

/// Which field links to the next block in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainField {
    /// `PreviousID` on advertisements, newest → oldest.
    Previous,
    /// `Next` on entry chunks.
    Next,
}

/// A recursive field exploration with a depth limit and an optional stop
/// node.
#[derive(Debug, Clone)]
pub(crate) struct Selector {
    pub field: ChainField,
    /// Maximum number of blocks to traverse; 0 means unlimited.
    pub depth_limit: u64,
    /// Stop before visiting this CID.
    pub stop_at: Option<Cid>,
}

impl Selector {
    pub fn ad_chain(depth_limit: u64) -> Self {
        Self {
            field: ChainField::Previous,
            depth_limit,
            stop_at: None,
        }
    }

    pub fn ad_chain_until(depth_limit: u64, stop_at: Cid) -> Self {
        Self {
            field: ChainField::Previous,
            depth_limit,
            stop_at: Some(stop_at),
        }
    }

    pub fn entries(depth_limit: u64) -> Self {
        Self {
            field: ChainField::Next,
            depth_limit,
            stop_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum WalkError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Walks a chain from `start` (the publisher head when `None`), loading
/// blocks into `store`, and returns the resolved start CID.
///
/// Blocks synced by an earlier walk are read from the store instead of the
/// publisher; the walk stops at the end of the chain, at `stop_at`, or once
/// `depth_limit` blocks have been visited.
pub(crate) async fn sync_chain<S: LinkStore + ?Sized>(
    fetcher: &dyn Fetcher,
    store: &S,
    start: Option<Cid>,
    sel: &Selector,
) -> Result<Cid, WalkError> {
    let head = match start {
        Some(c) => c,
        None => fetcher.head().await?,
    };

    let mut next = Some(head);
    let mut depth: u64 = 0;

    while let Some(cid) = next {
        if sel.stop_at == Some(cid) {
            break;
        }
        if sel.field == ChainField::Next && !schema::is_entries_present(&cid) {
            break;
        }
        if sel.depth_limit != 0 && depth >= sel.depth_limit {
            break;
        }

        let data = match store.open_read(&cid) {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => {
                let data = fetcher.block(&cid).await?;
                schema::verify_block(&cid, &data)?;
                store.commit(&cid, &data)?;
                trace!(%cid, depth, "synced block");
                data
            }
        };
        depth += 1;

        next = match sel.field {
            ChainField::Previous => schema::previous_link(&cid, &data)?,
            ChainField::Next => schema::decode_entry_chunk(&cid, &data)?.next,
        };
    }

    Ok(head)
}
