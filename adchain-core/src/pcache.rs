//! Provider information
//!
//! The JSON model the indexer serves for registered providers, and the
//! cache seam the distance tracker consumes. The cache's background polling
//! strategy is up to the implementation; only explicit `refresh` is part of
//! the contract.

use std::collections::HashMap;

use async_trait::async_trait;
use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::addr::AddrInfo;

#[derive(Debug, Error)]
pub enum PcacheError {
    #[error("indexer returned status {0}")]
    Status(u16),

    #[error("transport: {0}")]
    Transport(String),

    #[error("bad provider info: {0}")]
    Decode(String),
}

/// Peer identity plus addresses, in the indexer's JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddrInfo {
    #[serde(rename = "ID")]
    pub id: PeerId,
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<Multiaddr>,
}

impl From<&PeerAddrInfo> for AddrInfo {
    fn from(p: &PeerAddrInfo) -> Self {
        AddrInfo::new(p.id, p.addrs.clone())
    }
}

/// Registered-provider state as reported by an indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    #[serde(rename = "AddrInfo")]
    pub addr_info: PeerAddrInfo,
    #[serde(
        rename = "LastAdvertisement",
        default,
        with = "cid_json",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_advertisement: Option<Cid>,
    #[serde(
        rename = "LastAdvertisementTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_advertisement_time: Option<String>,
    #[serde(rename = "Publisher", default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<PeerAddrInfo>,
    #[serde(rename = "Lag", default, skip_serializing_if = "is_zero")]
    pub lag: i64,
    #[serde(
        rename = "FrozenAt",
        default,
        with = "cid_json",
        skip_serializing_if = "Option::is_none"
    )]
    pub frozen_at: Option<Cid>,
    #[serde(rename = "Inactive", default, skip_serializing_if = "is_false")]
    pub inactive: bool,
    #[serde(rename = "LastError", default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(
        rename = "LastErrorTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_error_time: Option<String>,
}

impl ProviderInfo {
    /// The advertisement publisher endpoint, when present and dialable.
    pub fn publisher_addr_info(&self) -> Option<AddrInfo> {
        let publisher = self.publisher.as_ref()?;
        if publisher.addrs.is_empty() {
            return None;
        }
        Some(publisher.into())
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// CIDs travel as `{"/": "<cid>"}` in the indexer's JSON.
pub(crate) mod cid_json {
    use cid::Cid;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct CidRef {
        #[serde(rename = "/")]
        path: String,
    }

    pub fn serialize<S: Serializer>(v: &Option<Cid>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(c) => CidRef {
                path: c.to_string(),
            }
            .serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Cid>, D::Error> {
        let raw: Option<CidRef> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(r) => r
                .path
                .parse()
                .map(Some)
                .map_err(|e| D::Error::custom(format!("bad CID: {e}"))),
        }
    }
}

/// Read access to provider information.
#[async_trait]
pub trait ProviderCache: Send + Sync {
    /// Re-reads provider state from the source.
    async fn refresh(&self) -> Result<(), PcacheError>;

    /// Looks up one provider; `Ok(None)` when unknown to the indexer.
    async fn get(&self, provider: &PeerId) -> Result<Option<ProviderInfo>, PcacheError>;

    /// All currently known providers.
    async fn list(&self) -> Vec<ProviderInfo>;
}

/// [`ProviderCache`] backed by an indexer's `/providers` resource.
pub struct HttpProviderCache {
    client: reqwest::Client,
    base: String,
    providers: RwLock<HashMap<PeerId, ProviderInfo>>,
}

impl HttpProviderCache {
    pub fn new(indexer_url: &str) -> Result<Self, PcacheError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PcacheError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base: indexer_url.trim_end_matches('/').to_string(),
            providers: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl ProviderCache for HttpProviderCache {
    async fn refresh(&self) -> Result<(), PcacheError> {
        let url = format!("{}/providers", self.base);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PcacheError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PcacheError::Status(resp.status().as_u16()));
        }
        let infos: Vec<ProviderInfo> = resp
            .json()
            .await
            .map_err(|e| PcacheError::Decode(e.to_string()))?;
        debug!(count = infos.len(), "refreshed provider cache");

        let mut providers = self.providers.write().await;
        providers.clear();
        for info in infos {
            providers.insert(info.addr_info.id, info);
        }
        Ok(())
    }

    async fn get(&self, provider: &PeerId) -> Result<Option<ProviderInfo>, PcacheError> {
        if let Some(info) = self.providers.read().await.get(provider) {
            return Ok(Some(info.clone()));
        }

        let url = format!("{}/providers/{}", self.base, provider);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PcacheError::Transport(e.to_string()))?;
        match resp.status().as_u16() {
            200 => {
                let info: ProviderInfo = resp
                    .json()
                    .await
                    .map_err(|e| PcacheError::Decode(e.to_string()))?;
                self.providers
                    .write()
                    .await
                    .insert(info.addr_info.id, info.clone());
                Ok(Some(info))
            }
            404 => Ok(None),
            other => Err(PcacheError::Status(other)),
        }
    }

    async fn list(&self) -> Vec<ProviderInfo> {
        self.providers.read().await.values().cloned().collect()
    }
}
