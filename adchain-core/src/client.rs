//! Advertisement publisher client
//!
//! Syncs advertisement chains and their entry-chunk chains from a single
//! publisher into a local block store, with retry and partial-progress
//! recovery. All operations are cancel-safe: dropping a returned future
//! aborts the work at the next suspension point.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::addr::{AddrError, AddrInfo};
use crate::entries::EntriesIterator;
use crate::fetch::{FetchError, Fetcher, HttpFetcher};
use crate::p2p::{P2pError, P2pFetcher, P2pHost};
use crate::schema::{self, Advertisement, SchemaError};
use crate::store::{BlockStore, LinkStore, StoreError};
use crate::sync::{sync_chain, Selector, WalkError};

/// Segment size for unbounded chain listings.
const LIST_SEGMENT: u64 = 2048;

/// Client configuration, passed at construction.
#[derive(Clone)]
pub struct ClientConfig {
    /// Ingest topic name; required for stream (pre-HTTP) publishers.
    pub topic: String,
    /// Max chunks fetched per entries chain; 0 means unlimited.
    pub entries_depth_limit: u64,
    /// Max advertisements traversed per query; 0 means unlimited.
    pub ad_chain_depth_limit: u64,
    /// Retries on sync failure; 0 means a single attempt.
    pub max_sync_retry: u32,
    /// Sleep between retries.
    pub sync_retry_backoff: Duration,
    /// Per-request transport timeout.
    pub http_timeout: Duration,
    /// Drop blocks from the store after a successful read.
    pub delete_after_read: bool,
    /// Externally-owned sync host; the client creates (and later closes) its
    /// own when absent.
    pub host: Option<Arc<P2pHost>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            topic: "/indexer/ingest/mainnet".into(),
            entries_depth_limit: 1000,
            ad_chain_depth_limit: 0,
            max_sync_retry: 10,
            sync_retry_backoff: Duration::from_millis(500),
            http_timeout: Duration::from_secs(10),
            delete_after_read: false,
            host: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("bad configuration: {0}")]
    Config(String),

    /// The publisher no longer hosts the requested content. Terminal; never
    /// retried.
    #[error("content not found at publisher")]
    ContentNotFound,

    #[error("exceeded maximum retries ({attempts}): {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    P2p(#[from] P2pError),

    #[error("write output: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WalkError> for ClientError {
    fn from(e: WalkError) -> Self {
        match e {
            WalkError::Fetch(e) => ClientError::Fetch(e),
            WalkError::Schema(e) => ClientError::Schema(e),
            WalkError::Store(e) => ClientError::Store(e),
        }
    }
}

fn is_content_not_found(e: &WalkError) -> bool {
    matches!(e, WalkError::Fetch(FetchError::NotFound))
}

/// Client for a single advertisement publisher.
pub struct PublisherClient {
    cfg: ClientConfig,
    publisher: AddrInfo,
    store: Arc<BlockStore>,
    fetcher: Box<dyn Fetcher>,
    host: Option<Arc<P2pHost>>,
    owns_host: bool,
}

impl PublisherClient {
    pub fn new(publisher: AddrInfo, cfg: ClientConfig) -> Result<Self, ClientError> {
        if publisher.addrs.is_empty() {
            return Err(AddrError::BadPublisherAddress("no addresses".into()).into());
        }

        let store = Arc::new(if cfg.delete_after_read {
            BlockStore::with_delete_after_read()
        } else {
            BlockStore::new()
        });

        let (host, owns_host) = match cfg.host.clone() {
            Some(h) => (h, false),
            None => (Arc::new(P2pHost::spawn(cfg.http_timeout)?), true),
        };

        let fetcher: Box<dyn Fetcher> = match HttpFetcher::new(&publisher, cfg.http_timeout) {
            Some(http) => Box::new(http?),
            None => {
                if cfg.topic.is_empty() {
                    return Err(ClientError::Config(
                        "topic must be configured for stream publishers".into(),
                    ));
                }
                Box::new(P2pFetcher::new(
                    host.clone(),
                    publisher.peer_id,
                    publisher.stream_addrs(),
                ))
            }
        };

        Ok(Self {
            cfg,
            publisher,
            store,
            fetcher,
            host: Some(host),
            owns_host,
        })
    }

    /// The publisher this client is bound to.
    pub fn publisher(&self) -> &AddrInfo {
        &self.publisher
    }

    /// Fetches and decodes a single advertisement, the chain head when
    /// `ad_cid` is `None`. Entries are not synced; removal ads and ads
    /// without entries are complete as returned.
    pub async fn get_advertisement(
        &self,
        ad_cid: Option<Cid>,
    ) -> Result<Advertisement, ClientError> {
        let ad_cid = self.sync_ad_with_retry(ad_cid).await?;
        let data = self.store.peek(&ad_cid)?;
        Ok(schema::decode_advertisement(&ad_cid, &data)?)
    }

    /// An iterator over the entries of a decoded advertisement, reading from
    /// this client's store. Returns `None` when the ad has no entries link.
    pub fn entries(&self, ad: &Advertisement) -> Option<EntriesIterator> {
        ad.entries
            .map(|root| EntriesIterator::new(root, self.store.clone()))
    }

    async fn sync_ad_with_retry(&self, ad_cid: Option<Cid>) -> Result<Cid, ClientError> {
        let sel = Selector::ad_chain(1);
        let mut attempt: u32 = 0;
        loop {
            match sync_chain(&*self.fetcher, &*self.store, ad_cid, &sel).await {
                Ok(cid) => return Ok(cid),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.cfg.max_sync_retry {
                        return Err(ClientError::MaxRetriesExceeded {
                            attempts: self.cfg.max_sync_retry,
                            source: Box::new(e.into()),
                        });
                    }
                    warn!(attempt, error = %e, "retrying ad sync");
                    tokio::time::sleep(self.cfg.sync_retry_backoff).await;
                }
            }
        }
    }

    /// Syncs the entries chain under `root`, up to the configured depth
    /// limit.
    ///
    /// A missing chain is terminal ([`ClientError::ContentNotFound`]). Other
    /// failures retry up to `max_sync_retry` times, resuming each time at
    /// the first chunk missing from the local store with the depth budget
    /// reduced by the chunks already synced.
    pub async fn sync_entries_with_retry(&self, root: Cid) -> Result<(), ClientError> {
        if !schema::is_entries_present(&root) {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        let mut id = root;
        let mut remaining = self.cfg.entries_depth_limit;

        loop {
            let sel = Selector::entries(remaining);
            match sync_chain(&*self.fetcher, &*self.store, Some(id), &sel).await {
                Ok(_) => return Ok(()),
                Err(e) if is_content_not_found(&e) => {
                    debug!(cid = %id, "entries no longer hosted");
                    return Err(ClientError::ContentNotFound);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.cfg.max_sync_retry {
                        return Err(ClientError::MaxRetriesExceeded {
                            attempts: self.cfg.max_sync_retry,
                            source: Box::new(e.into()),
                        });
                    }
                    let (next_missing, visited) = self.find_next_missing_chunk(id)?;
                    let next = match next_missing {
                        Some(c) => c,
                        // The chain is complete locally after all.
                        None => return Ok(()),
                    };
                    id = next;
                    if remaining != 0 {
                        remaining = remaining.saturating_sub(visited);
                        if remaining == 0 {
                            return Ok(());
                        }
                    }
                    warn!(attempt, error = %e, resume = %id, "retrying entries sync");
                    tokio::time::sleep(self.cfg.sync_retry_backoff).await;
                }
            }
        }
    }

    /// Walks the locally synced chunk chain from `from`, returning the first
    /// CID absent from the store and the number of chunks visited before it.
    fn find_next_missing_chunk(&self, from: Cid) -> Result<(Option<Cid>, u64), ClientError> {
        let mut next = from;
        let mut depth: u64 = 0;
        loop {
            if !schema::is_entries_present(&next) {
                return Ok((None, depth));
            }
            match self.store.peek(&next) {
                Err(StoreError::NotFound(_)) => return Ok((Some(next), depth)),
                Ok(data) => {
                    let chunk = schema::decode_entry_chunk(&next, &data)?;
                    match chunk.next {
                        Some(n) => {
                            next = n;
                            depth += 1;
                        }
                        None => return Ok((None, depth + 1)),
                    }
                }
            }
        }
    }

    /// Bound on one walk: an explicit `n` wins, otherwise the configured
    /// chain depth limit applies, otherwise the walk is unbounded.
    fn walk_limit(&self, n: i64) -> Option<u64> {
        if n > 0 {
            Some(n as u64)
        } else if self.cfg.ad_chain_depth_limit > 0 {
            Some(self.cfg.ad_chain_depth_limit)
        } else {
            None
        }
    }

    /// Writes up to `n` advertisement CIDs, one per line, from `latest`
    /// (the head when `None`) back along the chain. `n <= 0` lists the
    /// whole chain; long walks sync in fixed-size segments to cap memory.
    pub async fn list(
        &self,
        latest: Option<Cid>,
        n: i64,
        w: &mut (dyn Write + Send),
    ) -> Result<(), ClientError> {
        let mut remaining = self.walk_limit(n);
        let mut cursor = latest;

        loop {
            let depth = match remaining {
                Some(r) => r.min(LIST_SEGMENT),
                None => LIST_SEGMENT,
            };
            let head = sync_chain(
                &*self.fetcher,
                &*self.store,
                cursor,
                &Selector::ad_chain(depth),
            )
            .await?;

            let mut cid = head;
            let mut wrote: u64 = 0;
            let continue_at = loop {
                let data = match self.store.open_read(&cid) {
                    Ok(d) => d,
                    Err(StoreError::NotFound(_)) => break None,
                };
                writeln!(w, "{cid}")?;
                wrote += 1;
                match schema::previous_link(&cid, &data)? {
                    None => return Ok(()),
                    Some(prev) if wrote >= depth => break Some(prev),
                    Some(prev) => cid = prev,
                }
            };

            match (continue_at, &mut remaining) {
                (None, _) => return Ok(()),
                (Some(_), Some(r)) if *r <= wrote => return Ok(()),
                (Some(prev), Some(r)) => {
                    *r -= wrote;
                    cursor = Some(prev);
                }
                (Some(prev), None) => cursor = Some(prev),
            }
        }
    }

    /// Sends up to `n` decoded advertisements (all for `n <= 0`) from
    /// `latest` back along the chain, in walk order. Returns early, without
    /// error, when the receiver hangs up.
    pub async fn crawl(
        &self,
        latest: Option<Cid>,
        n: i64,
        tx: mpsc::Sender<Advertisement>,
    ) -> Result<(), ClientError> {
        let mut remaining = self.walk_limit(n);
        let mut cursor = latest;

        loop {
            let depth = match remaining {
                Some(r) => r.min(LIST_SEGMENT),
                None => LIST_SEGMENT,
            };
            let head = sync_chain(
                &*self.fetcher,
                &*self.store,
                cursor,
                &Selector::ad_chain(depth),
            )
            .await?;

            let mut cid = head;
            let mut sent: u64 = 0;
            let continue_at = loop {
                let data = match self.store.peek(&cid) {
                    Ok(d) => d,
                    Err(StoreError::NotFound(_)) => break None,
                };
                let ad = schema::decode_advertisement(&cid, &data)?;
                let prev = ad.previous_id;
                if tx.send(ad).await.is_err() {
                    return Ok(());
                }
                sent += 1;
                match prev {
                    None => return Ok(()),
                    Some(prev) if sent >= depth => break Some(prev),
                    Some(prev) => cid = prev,
                }
            };

            match (continue_at, &mut remaining) {
                (None, _) => return Ok(()),
                (Some(_), Some(r)) if *r <= sent => return Ok(()),
                (Some(prev), Some(r)) => {
                    *r -= sent;
                    cursor = Some(prev);
                }
                (Some(prev), None) => cursor = Some(prev),
            }
        }
    }

    /// Drops all synced blocks.
    pub fn clear_store(&self) {
        self.store.clear();
    }

    /// Closes the sync host when this client created it.
    pub async fn close(&self) {
        if self.owns_host {
            if let Some(host) = &self.host {
                host.close().await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_fetcher(fetcher: Box<dyn Fetcher>, cfg: ClientConfig) -> Self {
        let publisher = AddrInfo::new(
            libp2p::PeerId::random(),
            vec!["/ip4/127.0.0.1/tcp/1".parse().expect("valid multiaddr")],
        );
        let store = Arc::new(if cfg.delete_after_read {
            BlockStore::with_delete_after_read()
        } else {
            BlockStore::new()
        });
        Self {
            cfg,
            publisher,
            store,
            fetcher,
            host: None,
            owns_host: false,
        }
    }
}
