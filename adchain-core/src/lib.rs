//! adchain-core
//!
//! Client toolkit for the IPNI ecosystem: sync advertisement chains from
//! publishers over HTTP or libp2p, measure chain distance, track indexer
//! lag per provider, and verify that an indexer ingested a provider's
//! content.

pub mod addr;
pub mod car;
pub mod client;
pub mod count_store;
pub mod distance;
pub mod dtrack;
pub mod entries;
pub mod fetch;
pub mod find;
pub mod p2p;
pub mod pcache;
pub mod random;
pub mod sampler;
pub mod schema;
pub mod store;
pub mod verify;

mod sync;

#[cfg(test)]
mod fixture;

pub use addr::AddrInfo;
pub use client::{ClientConfig, ClientError, PublisherClient};
pub use distance::{AdDistance, DistanceConfig, DistanceError};
pub use dtrack::{run_distance_tracker, DistanceUpdate, TrackError, TrackerConfig};
pub use entries::EntriesIterator;
pub use find::{FindClient, FindResponse};
pub use pcache::{HttpProviderCache, ProviderCache, ProviderInfo};
pub use schema::{Advertisement, EntryChunk};
pub use verify::{AdStats, VerifyConfig, VerifyResult};
