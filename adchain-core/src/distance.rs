//! Advertisement chain distance
//!
//! Counts how many advertisements lie between two CIDs on a publisher's
//! chain. The walk commits into a fresh [`CountStore`] so tens of thousands
//! of ads can be traversed without buffering their bytes.

use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use thiserror::Error;
use tracing::debug;

use crate::addr::AddrInfo;
use crate::count_store::CountStore;
use crate::fetch::{FetchError, Fetcher, HttpFetcher};
use crate::p2p::{P2pError, P2pFetcher, P2pHost};
use crate::schema::SchemaError;
use crate::store::StoreError;
use crate::sync::{sync_chain, Selector, WalkError};

#[derive(Clone)]
pub struct DistanceConfig {
    /// Maximum chain depth to traverse; 0 means unlimited. Walks that would
    /// exceed this yield the `-1` sentinel instead of a distance.
    pub depth_limit: u64,
    /// Ingest topic name, for stream publishers.
    pub topic: String,
    /// Per-request transport timeout.
    pub http_timeout: Duration,
    /// Externally-owned sync host; one is created (and owned) when absent.
    pub host: Option<Arc<P2pHost>>,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            depth_limit: 5000,
            topic: "/indexer/ingest/mainnet".into(),
            http_timeout: Duration::from_secs(10),
            host: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DistanceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    P2p(#[from] P2pError),
}

impl From<WalkError> for DistanceError {
    fn from(e: WalkError) -> Self {
        match e {
            WalkError::Fetch(e) => DistanceError::Fetch(e),
            WalkError::Schema(e) => DistanceError::Schema(e),
            WalkError::Store(e) => DistanceError::Store(e),
        }
    }
}

/// Distance finder over advertisement chains.
pub struct AdDistance {
    cfg: DistanceConfig,
    host: Arc<P2pHost>,
    owns_host: bool,
}

impl AdDistance {
    pub fn new(cfg: DistanceConfig) -> Result<Self, DistanceError> {
        let (host, owns_host) = match cfg.host.clone() {
            Some(h) => (h, false),
            None => (Arc::new(P2pHost::spawn(cfg.http_timeout)?), true),
        };
        Ok(Self {
            cfg,
            host,
            owns_host,
        })
    }

    /// Number of advertisements from `newest` down to, but not including,
    /// `oldest`. When `newest` is `None` the publisher's current head is
    /// used, and the resolved head CID is returned alongside the distance so
    /// callers can seed later queries.
    ///
    /// A walk that exceeds the configured depth limit returns `-1`; callers
    /// must not interpret it as a real distance.
    pub async fn get(
        &self,
        publisher: &AddrInfo,
        oldest: &Cid,
        newest: Option<Cid>,
    ) -> Result<(i64, Cid), DistanceError> {
        let fetcher = self.fetcher_for(publisher)?;

        let depth_limit = match self.cfg.depth_limit {
            0 => 0,
            // One extra level for the stop node.
            n => n + 1,
        };
        let store = CountStore::new();
        let sel = Selector::ad_chain_until(depth_limit, *oldest);

        let head = sync_chain(&*fetcher, &store, newest, &sel).await?;

        let count = store.take() as i64;
        let dist = if self.cfg.depth_limit != 0 && count > self.cfg.depth_limit as i64 {
            -1
        } else {
            count
        };
        debug!(publisher = %publisher.peer_id, %head, dist, "ad distance");
        Ok((dist, head))
    }

    fn fetcher_for(&self, publisher: &AddrInfo) -> Result<Box<dyn Fetcher>, DistanceError> {
        match HttpFetcher::new(publisher, self.cfg.http_timeout) {
            Some(http) => Ok(Box::new(http?)),
            None => Ok(Box::new(P2pFetcher::new(
                self.host.clone(),
                publisher.peer_id,
                publisher.stream_addrs(),
            ))),
        }
    }

    /// Closes the sync host when owned by this instance.
    pub async fn close(&self) {
        if self.owns_host {
            self.host.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn get_with_fetcher(
        &self,
        fetcher: &dyn Fetcher,
        oldest: &Cid,
        newest: Option<Cid>,
    ) -> Result<(i64, Cid), DistanceError> {
        let depth_limit = match self.cfg.depth_limit {
            0 => 0,
            n => n + 1,
        };
        let store = CountStore::new();
        let sel = Selector::ad_chain_until(depth_limit, *oldest);
        let head = sync_chain(fetcher, &store, newest, &sel).await?;
        let count = store.take() as i64;
        let dist = if self.cfg.depth_limit != 0 && count > self.cfg.depth_limit as i64 {
            -1
        } else {
            count
        };
        Ok((dist, head))
    }
}
