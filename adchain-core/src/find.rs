//! Indexer find client
//!
//! Batch multihash lookups against an indexer's find API. Multihashes and
//! other byte fields travel base64-encoded in the JSON bodies.

use multihash::Multihash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::pcache::PeerAddrInfo;

#[derive(Debug, Error)]
pub enum FindError {
    #[error("indexer returned status {0}")]
    Status(u16),

    #[error("transport: {0}")]
    Transport(String),

    #[error("bad find response: {0}")]
    Decode(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FindResponse {
    #[serde(rename = "MultihashResults", default)]
    pub multihash_results: Vec<MultihashResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MultihashResult {
    #[serde(rename = "Multihash", with = "mh_b64")]
    pub multihash: Multihash,
    #[serde(rename = "ProviderResults", default)]
    pub provider_results: Vec<ProviderResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderResult {
    #[serde(rename = "ContextID", default, with = "bytes_b64")]
    pub context_id: Vec<u8>,
    #[serde(rename = "Metadata", default, with = "bytes_b64")]
    pub metadata: Vec<u8>,
    #[serde(rename = "Provider")]
    pub provider: PeerAddrInfo,
}

#[derive(Serialize)]
struct FindRequest {
    #[serde(rename = "Multihashes")]
    multihashes: Vec<String>,
}

pub(crate) mod bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(Vec::new()),
            Some(text) => STANDARD
                .decode(text)
                .map_err(|e| D::Error::custom(format!("bad base64: {e}"))),
        }
    }
}

mod mh_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use multihash::Multihash;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Multihash, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v.to_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Multihash, D::Error> {
        let text = String::deserialize(d)?;
        let bytes = STANDARD
            .decode(text)
            .map_err(|e| D::Error::custom(format!("bad base64: {e}")))?;
        Multihash::from_bytes(&bytes).map_err(|e| D::Error::custom(format!("bad multihash: {e}")))
    }
}

/// Client for one indexer's find endpoint.
pub struct FindClient {
    client: reqwest::Client,
    base: String,
}

impl FindClient {
    pub fn new(indexer_url: &str) -> Result<Self, FindError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| FindError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base: indexer_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn indexer_url(&self) -> &str {
        &self.base
    }

    /// Looks up a batch of multihashes. An indexer that knows none of them
    /// answers 404; that is an empty response, not an error.
    pub async fn find_batch(&self, mhs: &[Multihash]) -> Result<FindResponse, FindError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        if mhs.is_empty() {
            return Ok(FindResponse::default());
        }

        let request = FindRequest {
            multihashes: mhs.iter().map(|m| STANDARD.encode(m.to_bytes())).collect(),
        };
        let url = format!("{}/multihash", self.base);
        debug!(count = mhs.len(), %url, "find batch");

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FindError::Transport(e.to_string()))?;
        match resp.status().as_u16() {
            200 => resp
                .json()
                .await
                .map_err(|e| FindError::Decode(e.to_string())),
            404 => Ok(FindResponse::default()),
            other => Err(FindError::Status(other)),
        }
    }
}
