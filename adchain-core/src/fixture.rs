//! Shared in-crate test fixtures: signed advertisement chains and entry
//! chunk chains as block maps, served through mock or HTTP publishers.
#![cfg(test)]

use std::collections::HashMap;

use cid::Cid;
use libp2p::identity::Keypair;
use multihash::Multihash;
use serde_bytes::ByteBuf;

use crate::random;
use crate::schema::{
    self, encode_advertisement, encode_entry_chunk, sign_advertisement, RawAdvertisement,
    RawEntryChunk, DAG_CBOR,
};

pub(crate) struct Fixture {
    pub key: Keypair,
    pub blocks: HashMap<Cid, Vec<u8>>,
    /// Advertisement CIDs, newest first.
    pub ad_cids: Vec<Cid>,
    pub head: Cid,
}

/// Per-advertisement shape for [`ad_chain_with`].
pub(crate) struct AdSpec {
    pub is_rm: bool,
    pub context_id: Vec<u8>,
    /// Multihashes per entry chunk; empty means no entries.
    pub chunk_sizes: Vec<usize>,
}

impl AdSpec {
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
}

/// Builds an entries chunk chain into `blocks`, returning the root and the
/// multihashes in publication order.
pub(crate) fn entries_chain(
    blocks: &mut HashMap<Cid, Vec<u8>>,
    rng: &mut rand::rngs::StdRng,
    sizes: &[usize],
) -> (Cid, Vec<Multihash>) {
    let per_chunk: Vec<Vec<Multihash>> = sizes
        .iter()
        .map(|n| random::multihashes(rng, *n))
        .collect();

    let mut next: Option<Cid> = None;
    for mhs in per_chunk.iter().rev() {
        let raw = RawEntryChunk {
            entries: mhs.iter().map(|m| ByteBuf::from(m.to_bytes())).collect(),
            next,
        };
        let bytes = encode_entry_chunk(&raw).unwrap();
        let cid = schema::block_cid(&bytes, DAG_CBOR);
        blocks.insert(cid, bytes);
        next = Some(cid);
    }
    (next.unwrap(), per_chunk.into_iter().flatten().collect())
}

/// Builds a signed advertisement chain, oldest ad built first. Specs are
/// given newest first, matching the returned `ad_cids` order.
pub(crate) fn ad_chain_with(specs: &[AdSpec]) -> Fixture {
    let key = Keypair::generate_ed25519();
    let provider = key.public().to_peer_id().to_string();
    let mut rng = random::rng(42);
    let mut blocks = HashMap::new();

    let mut previous: Option<Cid> = None;
    let mut ad_cids_oldest_first = Vec::new();

    for spec in specs.iter().rev() {
        let entries = if spec.chunk_sizes.is_empty() {
            schema::no_entries_cid()
        } else {
            entries_chain(&mut blocks, &mut rng, &spec.chunk_sizes).0
        };

        let mut ad = RawAdvertisement {
            previous_id: previous,
            provider: provider.clone(),
            addresses: vec!["/ip4/127.0.0.1/tcp/9999".into()],
            signature: ByteBuf::new(),
            entries,
            context_id: ByteBuf::from(spec.context_id.clone()),
            metadata: ByteBuf::from(vec![0x90, 0x0d]),
            is_rm: spec.is_rm,
            extended_provider: None,
        };
        ad.signature = ByteBuf::from(sign_advertisement(&ad, &key).unwrap());

        let bytes = encode_advertisement(&ad, DAG_CBOR).unwrap();
        let cid = schema::block_cid(&bytes, DAG_CBOR);
        blocks.insert(cid, bytes);
        ad_cids_oldest_first.push(cid);
        previous = Some(cid);
    }

    let mut ad_cids: Vec<Cid> = ad_cids_oldest_first;
    ad_cids.reverse();
    let head = ad_cids[0];
    Fixture {
        key,
        blocks,
        ad_cids,
        head,
    }
}

/// A chain of `n` plain advertisements without entries.
pub(crate) fn ad_chain(n: usize) -> Fixture {
    let specs: Vec<AdSpec> = (0..n).map(|_| AdSpec::plain()).collect();
    ad_chain_with(&specs)
}

/// Entries root CID of an advertisement block in the fixture.
pub(crate) fn entries_root(fx: &Fixture, ad: &Cid) -> Option<Cid> {
    let data = fx.blocks.get(ad)?;
    let decoded = schema::decode_advertisement(ad, data).unwrap();
    decoded.entries
}
