//! Publisher transport
//!
//! The sync engine pulls blocks through the [`Fetcher`] seam: resolve the
//! publisher's head CID, or fetch one block by CID. [`HttpFetcher`] talks
//! plain HTTP(S); [`crate::p2p::P2pFetcher`] speaks the same request shape
//! over a libp2p stream.

use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use thiserror::Error;
use tracing::debug;

use crate::addr::AddrInfo;

/// Path of the head resource on a publisher.
pub const HEAD_PATH: &str = "/ipni/v1/ad/head";

/// Path prefix for block resources on a publisher.
pub const AD_PATH_PREFIX: &str = "/ipni/v1/ad/";

#[derive(Debug, Error)]
pub enum FetchError {
    /// The publisher no longer hosts the requested content.
    #[error("content not found")]
    NotFound,

    #[error("publisher returned status {0}")]
    Status(u16),

    #[error("bad head response: {0}")]
    BadHead(String),

    #[error("transport: {0}")]
    Transport(String),
}

/// Block access to a single publisher.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resolves the newest advertisement CID known to the publisher.
    async fn head(&self) -> Result<Cid, FetchError>;

    /// Fetches the raw bytes of one block.
    async fn block(&self, cid: &Cid) -> Result<Vec<u8>, FetchError>;
}

pub(crate) fn parse_head_body(body: &[u8]) -> Result<Cid, FetchError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| FetchError::BadHead(e.to_string()))?
        .trim();
    text.parse()
        .map_err(|e| FetchError::BadHead(format!("{text:.64}: {e}")))
}

/// HTTP(S) publisher transport.
pub struct HttpFetcher {
    client: reqwest::Client,
    bases: Vec<String>,
}

impl HttpFetcher {
    /// Builds a fetcher over every HTTP-capable address of `publisher`.
    /// Returns `None` when the publisher has no HTTP-capable address.
    pub fn new(publisher: &AddrInfo, timeout: Duration) -> Option<Result<Self, FetchError>> {
        let bases: Vec<String> = publisher
            .addrs
            .iter()
            .filter_map(|a| crate::addr::http_base_url(a).ok())
            .collect();
        if bases.is_empty() {
            return None;
        }
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => return Some(Err(FetchError::Transport(e.to_string()))),
        };
        Some(Ok(Self { client, bases }))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_err = FetchError::Transport("no addresses".into());
        for base in &self.bases {
            let url = format!("{base}{path}");
            debug!(%url, "publisher fetch");
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    match status {
                        200 => {
                            return resp
                                .bytes()
                                .await
                                .map(|b| b.to_vec())
                                .map_err(|e| FetchError::Transport(e.to_string()));
                        }
                        404 => return Err(FetchError::NotFound),
                        other => last_err = FetchError::Status(other),
                    }
                }
                Err(e) => last_err = FetchError::Transport(e.to_string()),
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn head(&self) -> Result<Cid, FetchError> {
        let body = self.get(HEAD_PATH).await?;
        parse_head_body(&body)
    }

    async fn block(&self, cid: &Cid) -> Result<Vec<u8>, FetchError> {
        self.get(&format!("{AD_PATH_PREFIX}{cid}")).await
    }
}
