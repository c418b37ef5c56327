//! Shared integration fixtures: a signed advertisement chain, an in-process
//! HTTP publisher serving it, and an in-process indexer with a find API and
//! provider listings.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use adchain_core::addr::AddrInfo;
use adchain_core::pcache::{PcacheError, ProviderCache, ProviderInfo};
use adchain_core::random;
use adchain_core::schema::{
    self, encode_advertisement, encode_entry_chunk, sign_advertisement, RawAdvertisement,
    RawEntryChunk, DAG_CBOR,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cid::Cid;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use multihash::Multihash;
use serde::Deserialize;
use serde_bytes::ByteBuf;

/// Shape of one advertisement in a fixture chain, newest first.
pub struct AdShape {
    pub is_rm: bool,
    pub context_id: Vec<u8>,
    /// Multihashes per entry chunk; empty means no entries.
    pub chunk_sizes: Vec<usize>,
}

impl AdShape {
    pub fn plain() -> Self {
        Self {
            is_rm: false,
            context_id: b"ctx".to_vec(),
            chunk_sizes: Vec::new(),
        }
    }

    pub fn with_entries(chunk_sizes: &[usize]) -> Self {
        Self {
            chunk_sizes: chunk_sizes.to_vec(),
            ..Self::plain()
        }
    }

    pub fn removal(context_id: &[u8]) -> Self {
        Self {
            is_rm: true,
            context_id: context_id.to_vec(),
            chunk_sizes: Vec::new(),
        }
    }

    pub fn for_context(context_id: &[u8], chunk_sizes: &[usize]) -> Self {
        Self {
            is_rm: false,
            context_id: context_id.to_vec(),
            chunk_sizes: chunk_sizes.to_vec(),
        }
    }
}

pub struct Chain {
    pub key: Keypair,
    pub provider: PeerId,
    pub blocks: HashMap<Cid, Vec<u8>>,
    /// Advertisement CIDs, newest first.
    pub ad_cids: Vec<Cid>,
    pub head: Cid,
    /// Entries multihashes per advertisement, publication order.
    pub entries: HashMap<Cid, Vec<Multihash>>,
}

pub fn build_chain(shapes: &[AdShape]) -> Chain {
    let key = Keypair::generate_ed25519();
    let provider = key.public().to_peer_id();
    let mut rng = random::rng(1234);
    let mut blocks = HashMap::new();
    let mut entries = HashMap::new();

    let mut previous: Option<Cid> = None;
    let mut ads_oldest_first = Vec::new();

    for shape in shapes.iter().rev() {
        let (entries_root, mhs) = if shape.chunk_sizes.is_empty() {
            (schema::no_entries_cid(), Vec::new())
        } else {
            let per_chunk: Vec<Vec<Multihash>> = shape
                .chunk_sizes
                .iter()
                .map(|n| random::multihashes(&mut rng, *n))
                .collect();
            let mut next: Option<Cid> = None;
            for chunk in per_chunk.iter().rev() {
                let raw = RawEntryChunk {
                    entries: chunk.iter().map(|m| ByteBuf::from(m.to_bytes())).collect(),
                    next,
                };
                let bytes = encode_entry_chunk(&raw).unwrap();
                let cid = schema::block_cid(&bytes, DAG_CBOR);
                blocks.insert(cid, bytes);
                next = Some(cid);
            }
            (
                next.unwrap(),
                per_chunk.into_iter().flatten().collect::<Vec<_>>(),
            )
        };

        let mut ad = RawAdvertisement {
            previous_id: previous,
            provider: provider.to_string(),
            addresses: vec!["/ip4/127.0.0.1/tcp/9999".into()],
            signature: ByteBuf::new(),
            entries: entries_root,
            context_id: ByteBuf::from(shape.context_id.clone()),
            metadata: ByteBuf::from(vec![0x90, 0x0d]),
            is_rm: shape.is_rm,
            extended_provider: None,
        };
        ad.signature = ByteBuf::from(sign_advertisement(&ad, &key).unwrap());

        let bytes = encode_advertisement(&ad, DAG_CBOR).unwrap();
        let cid = schema::block_cid(&bytes, DAG_CBOR);
        blocks.insert(cid, bytes);
        entries.insert(cid, mhs);
        ads_oldest_first.push(cid);
        previous = Some(cid);
    }

    let mut ad_cids = ads_oldest_first;
    ad_cids.reverse();
    let head = ad_cids[0];
    Chain {
        key,
        provider,
        blocks,
        ad_cids,
        head,
        entries,
    }
}

//
// Publisher fixture
//

pub struct PublisherState {
    pub head: Mutex<Cid>,
    pub blocks: Mutex<HashMap<Cid, Vec<u8>>>,
    /// Answer this many block requests with a 500 before recovering.
    pub fail_next: Mutex<u32>,
    /// Requests per block CID, counted before failure injection.
    pub hits: Mutex<HashMap<String, u32>>,
}

impl PublisherState {
    pub fn from_chain(chain: &Chain) -> Arc<Self> {
        Arc::new(Self {
            head: Mutex::new(chain.head),
            blocks: Mutex::new(chain.blocks.clone()),
            fail_next: Mutex::new(0),
            hits: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_head(&self, head: Cid) {
        *self.head.lock().unwrap() = head;
    }

    pub fn remove_block(&self, cid: &Cid) {
        self.blocks.lock().unwrap().remove(cid);
    }

    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock().unwrap() = n;
    }

    pub fn hits_for(&self, cid: &Cid) -> u32 {
        self.hits
            .lock()
            .unwrap()
            .get(&cid.to_string())
            .copied()
            .unwrap_or(0)
    }
}

async fn publisher_head(State(state): State<Arc<PublisherState>>) -> String {
    state.head.lock().unwrap().to_string()
}

async fn publisher_block(
    Path(cid): Path<String>,
    State(state): State<Arc<PublisherState>>,
) -> impl IntoResponse {
    *state.hits.lock().unwrap().entry(cid.clone()).or_insert(0) += 1;

    {
        let mut fail = state.fail_next.lock().unwrap();
        if *fail > 0 {
            *fail -= 1;
            return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
        }
    }

    let parsed: Cid = match cid.parse() {
        Ok(c) => c,
        Err(_) => return (StatusCode::BAD_REQUEST, Vec::new()),
    };
    match state.blocks.lock().unwrap().get(&parsed) {
        Some(data) => (StatusCode::OK, data.clone()),
        None => (StatusCode::NOT_FOUND, b"content not found".to_vec()),
    }
}

/// Serves `/ipni/v1/ad/*` from the state, returning the bound address.
pub async fn serve_publisher(state: Arc<PublisherState>) -> SocketAddr {
    let app = Router::new()
        .route("/ipni/v1/ad/head", get(publisher_head))
        .route("/ipni/v1/ad/:cid", get(publisher_block))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn publisher_addr_info(peer: PeerId, addr: SocketAddr) -> AddrInfo {
    AddrInfo::new(
        peer,
        vec![format!("/ip4/127.0.0.1/tcp/{}/http", addr.port())
            .parse()
            .unwrap()],
    )
}

//
// Indexer fixture
//

pub struct IndexerState {
    /// Providers indexed per multihash (keyed by multihash bytes).
    pub indexed: Mutex<HashMap<Vec<u8>, Vec<PeerId>>>,
    pub providers: Mutex<Vec<ProviderInfo>>,
    pub find_requests: Mutex<u32>,
}

impl IndexerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            indexed: Mutex::new(HashMap::new()),
            providers: Mutex::new(Vec::new()),
            find_requests: Mutex::new(0),
        })
    }

    pub fn index(&self, mhs: &[Multihash], provider: PeerId) {
        let mut indexed = self.indexed.lock().unwrap();
        for mh in mhs {
            indexed.entry(mh.to_bytes()).or_default().push(provider);
        }
    }

    pub fn find_request_count(&self) -> u32 {
        *self.find_requests.lock().unwrap()
    }
}

#[derive(Deserialize)]
struct FindRequestBody {
    #[serde(rename = "Multihashes")]
    multihashes: Vec<String>,
}

async fn indexer_find(
    State(state): State<Arc<IndexerState>>,
    Json(body): Json<FindRequestBody>,
) -> impl IntoResponse {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    *state.find_requests.lock().unwrap() += 1;

    let indexed = state.indexed.lock().unwrap();
    let mut results = Vec::new();
    for text in body.multihashes {
        let bytes = match STANDARD.decode(&text) {
            Ok(b) => b,
            Err(_) => return (StatusCode::BAD_REQUEST, Json(serde_json::Value::Null)),
        };
        if let Some(providers) = indexed.get(&bytes) {
            let provider_results: Vec<serde_json::Value> = providers
                .iter()
                .map(|pid| {
                    serde_json::json!({
                        "ContextID": STANDARD.encode(b"ctx"),
                        "Metadata": STANDARD.encode([0x90u8, 0x0d]),
                        "Provider": {"ID": pid.to_string(), "Addrs": ["/ip4/127.0.0.1/tcp/9999"]}
                    })
                })
                .collect();
            results.push(serde_json::json!({
                "Multihash": text,
                "ProviderResults": provider_results,
            }));
        }
    }

    if results.is_empty() {
        return (StatusCode::NOT_FOUND, Json(serde_json::Value::Null));
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({"MultihashResults": results})),
    )
}

async fn indexer_providers(State(state): State<Arc<IndexerState>>) -> impl IntoResponse {
    Json(state.providers.lock().unwrap().clone())
}

async fn indexer_provider(
    Path(pid): Path<String>,
    State(state): State<Arc<IndexerState>>,
) -> impl IntoResponse {
    let providers = state.providers.lock().unwrap();
    match providers
        .iter()
        .find(|p| p.addr_info.id.to_string() == pid)
    {
        Some(info) => (StatusCode::OK, Json(serde_json::to_value(info).unwrap())),
        None => (StatusCode::NOT_FOUND, Json(serde_json::Value::Null)),
    }
}

/// Serves a find API plus provider listings, returning the base URL.
pub async fn serve_indexer(state: Arc<IndexerState>) -> String {
    let app = Router::new()
        .route("/multihash", post(indexer_find))
        .route("/providers", get(indexer_providers))
        .route("/providers/:pid", get(indexer_provider))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

//
// Provider cache over a fixed map (no HTTP), for tracker tests.
//

pub struct StaticCache {
    pub infos: Mutex<HashMap<PeerId, ProviderInfo>>,
}

impl StaticCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            infos: Mutex::new(HashMap::new()),
        })
    }

    pub fn put(&self, info: ProviderInfo) {
        self.infos.lock().unwrap().insert(info.addr_info.id, info);
    }
}

#[async_trait::async_trait]
impl ProviderCache for StaticCache {
    async fn refresh(&self) -> Result<(), PcacheError> {
        Ok(())
    }

    async fn get(&self, provider: &PeerId) -> Result<Option<ProviderInfo>, PcacheError> {
        Ok(self.infos.lock().unwrap().get(provider).cloned())
    }

    async fn list(&self) -> Vec<ProviderInfo> {
        self.infos.lock().unwrap().values().cloned().collect()
    }
}

/// Multihashes of every non-removal ad in the chain, deduplicated.
pub fn all_entry_multihashes(chain: &Chain) -> Vec<Multihash> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cid in &chain.ad_cids {
        for mh in chain.entries.get(cid).into_iter().flatten() {
            if seen.insert(mh.to_bytes()) {
                out.push(*mh);
            }
        }
    }
    out
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}
