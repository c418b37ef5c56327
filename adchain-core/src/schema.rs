//! IPNI ingest schema
//!
//! Typed advertisement and entry-chunk records, their DAG-CBOR / DAG-JSON
//! codecs (selected by the CID codec), CID↔bytes verification, and the
//! signed-envelope scheme advertisements carry.

use std::str::FromStr;
use std::sync::OnceLock;

use cid::Cid;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// DAG-CBOR multicodec.
pub const DAG_CBOR: u64 = 0x71;

/// DAG-JSON multicodec.
pub const DAG_JSON: u64 = 0x0129;

/// SHA2-256 multihash code.
pub const SHA2_256: u64 = 0x12;

/// Identity multihash code.
const IDENTITY: u64 = 0x00;

/// Domain separator of the advertisement signature envelope.
const SIG_DOMAIN: &[u8] = b"indexer";

/// Payload type of the advertisement signature envelope.
const SIG_CODEC: &[u8] = b"/indexer/ingest/adSignature";

/// String form of the well-known "no entries" CID.
pub const NO_ENTRIES_STR: &str = "bafkreehdwdcefgh4dqkjv67uzcmw7oje";

/// The well-known CID that marks an advertisement as carrying no entries.
pub fn no_entries_cid() -> Cid {
    static CELL: OnceLock<Cid> = OnceLock::new();
    *CELL.get_or_init(|| NO_ENTRIES_STR.parse().expect("well-known CID is valid"))
}

/// False iff `c` is the no-entries sentinel.
pub fn is_entries_present(c: &Cid) -> bool {
    *c != no_entries_cid()
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed advertisement: {0}")]
    MalformedAd(String),

    #[error("malformed entry chunk: {0}")]
    MalformedEntryChunk(String),

    #[error("unsupported codec 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("unsupported multihash code 0x{0:x}")]
    UnsupportedMultihash(u64),

    #[error("block does not hash to its CID: expected {expected}, got {actual}")]
    HashMismatch { expected: Cid, actual: Cid },
}

/// Signature validation failure, carried inside the decoded record so
/// callers may still display the rest of the advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigError {
    #[error("cannot decode signature envelope: {0}")]
    Envelope(String),

    #[error("cannot decode signer public key: {0}")]
    Key(String),

    #[error("unexpected signature payload type")]
    WrongPayloadType,

    #[error("signature payload does not match advertisement content")]
    PayloadMismatch,

    #[error("signature verification failed")]
    Invalid,

    #[error("signing failed: {0}")]
    Signing(String),
}

//
// Wire records
//
// Field order matches the upstream schema so re-encoding a decoded block
// reproduces its bytes, and therefore its CID.
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAdvertisement {
    #[serde(rename = "PreviousID", default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Cid>,
    #[serde(rename = "Provider")]
    pub provider: String,
    #[serde(rename = "Addresses")]
    pub addresses: Vec<String>,
    #[serde(rename = "Signature")]
    pub signature: ByteBuf,
    #[serde(rename = "Entries")]
    pub entries: Cid,
    #[serde(rename = "ContextID")]
    pub context_id: ByteBuf,
    #[serde(rename = "Metadata")]
    pub metadata: ByteBuf,
    #[serde(rename = "IsRm")]
    pub is_rm: bool,
    #[serde(rename = "ExtendedProvider", default, skip_serializing_if = "Option::is_none")]
    pub extended_provider: Option<RawExtendedProvider>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExtendedProvider {
    #[serde(rename = "Providers")]
    pub providers: Vec<RawProviderEntry>,
    #[serde(rename = "Override")]
    pub override_providers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProviderEntry {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Addresses")]
    pub addresses: Vec<String>,
    #[serde(rename = "Metadata")]
    pub metadata: ByteBuf,
    #[serde(rename = "Signature")]
    pub signature: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntryChunk {
    #[serde(rename = "Entries")]
    pub entries: Vec<ByteBuf>,
    #[serde(rename = "Next", default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Cid>,
}

//
// Decoded records
//

/// A decoded advertisement.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// The advertisement's own CID.
    pub id: Cid,
    /// Link to the older advertisement; `None` at the chain tail.
    pub previous_id: Option<Cid>,
    /// Content owner.
    pub provider_id: PeerId,
    /// Opaque grouping key; `(provider_id, context_id)` names a content set.
    pub context_id: Vec<u8>,
    /// Opaque retrieval metadata, possibly empty.
    pub metadata: Vec<u8>,
    /// Addresses where the provider serves the content.
    pub addresses: Vec<String>,
    /// Root of the entries chunk chain; may be the no-entries sentinel.
    pub entries: Option<Cid>,
    /// True when this advertisement retracts all content for its context ID.
    pub is_remove: bool,
    pub extended_providers: Option<ExtendedProviders>,
    /// Raw signature envelope bytes.
    pub signature: Vec<u8>,
    /// Identity of the envelope signer, when the envelope decodes.
    pub signer_id: Option<PeerId>,
    /// Signature validation error; `None` when the signature is valid.
    pub signature_error: Option<SigError>,
}

#[derive(Debug, Clone)]
pub struct ExtendedProviders {
    pub override_providers: bool,
    pub providers: Vec<ExtendedProviderInfo>,
}

#[derive(Debug, Clone)]
pub struct ExtendedProviderInfo {
    pub id: String,
    pub addresses: Vec<String>,
    pub metadata: Vec<u8>,
}

impl Advertisement {
    /// True when the entries root is defined and not the no-entries sentinel.
    pub fn has_entries(&self) -> bool {
        matches!(&self.entries, Some(c) if is_entries_present(c))
    }
}

/// A decoded entries chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryChunk {
    pub entries: Vec<Multihash>,
    pub next: Option<Cid>,
}

//
// Codecs
//

/// Computes the CID of a block under the given codec (sha2-256, CIDv1).
pub fn block_cid(data: &[u8], codec: u64) -> Cid {
    let digest = Sha256::digest(data);
    let mh = Multihash::wrap(SHA2_256, &digest).expect("sha2-256 digest length is valid");
    Cid::new_v1(codec, mh)
}

/// Verifies that `data` hashes to `cid`.
pub fn verify_block(cid: &Cid, data: &[u8]) -> Result<(), SchemaError> {
    let code = cid.hash().code();
    let actual = match code {
        SHA2_256 => {
            let digest = Sha256::digest(data);
            Multihash::wrap(code, &digest).expect("sha2-256 digest length is valid")
        }
        IDENTITY => Multihash::wrap(code, data)
            .map_err(|_| SchemaError::UnsupportedMultihash(code))?,
        other => return Err(SchemaError::UnsupportedMultihash(other)),
    };
    let expect = Cid::new_v1(cid.codec(), actual);
    // Compare digests rather than whole CIDs so CIDv0 inputs still verify.
    if expect.hash().digest() != cid.hash().digest() {
        return Err(SchemaError::HashMismatch {
            expected: *cid,
            actual: expect,
        });
    }
    Ok(())
}

fn decode_raw_ad(codec: u64, data: &[u8]) -> Result<RawAdvertisement, SchemaError> {
    match codec {
        DAG_CBOR => serde_ipld_dagcbor::from_slice(data)
            .map_err(|e| SchemaError::MalformedAd(e.to_string())),
        DAG_JSON => serde_ipld_dagjson::from_slice(data)
            .map_err(|e| SchemaError::MalformedAd(e.to_string())),
        other => Err(SchemaError::UnsupportedCodec(other)),
    }
}

/// Encodes a raw advertisement under the given codec.
pub fn encode_advertisement(ad: &RawAdvertisement, codec: u64) -> Result<Vec<u8>, SchemaError> {
    match codec {
        DAG_CBOR => {
            serde_ipld_dagcbor::to_vec(ad).map_err(|e| SchemaError::MalformedAd(e.to_string()))
        }
        DAG_JSON => {
            serde_ipld_dagjson::to_vec(ad).map_err(|e| SchemaError::MalformedAd(e.to_string()))
        }
        other => Err(SchemaError::UnsupportedCodec(other)),
    }
}

/// Encodes an entry chunk as DAG-CBOR.
pub fn encode_entry_chunk(chunk: &RawEntryChunk) -> Result<Vec<u8>, SchemaError> {
    serde_ipld_dagcbor::to_vec(chunk).map_err(|e| SchemaError::MalformedEntryChunk(e.to_string()))
}

/// Decodes an advertisement block, verifying its embedded signature.
///
/// Signature failures do not abort the decode; they are attached to the
/// returned record as `signature_error` together with the recovered
/// `signer_id` when available.
pub fn decode_advertisement(id: &Cid, data: &[u8]) -> Result<Advertisement, SchemaError> {
    let raw = decode_raw_ad(id.codec(), data)?;

    let provider_id = PeerId::from_str(&raw.provider)
        .map_err(|e| SchemaError::MalformedAd(format!("bad provider ID: {e}")))?;

    let (signer_id, signature_error) = verify_signature(&raw);

    let extended_providers = raw.extended_provider.as_ref().map(|xp| ExtendedProviders {
        override_providers: xp.override_providers,
        providers: xp
            .providers
            .iter()
            .map(|p| ExtendedProviderInfo {
                id: p.id.clone(),
                addresses: p.addresses.clone(),
                metadata: p.metadata.to_vec(),
            })
            .collect(),
    });

    Ok(Advertisement {
        id: *id,
        previous_id: raw.previous_id,
        provider_id,
        context_id: raw.context_id.into_vec(),
        metadata: raw.metadata.into_vec(),
        addresses: raw.addresses,
        entries: Some(raw.entries),
        is_remove: raw.is_rm,
        extended_providers,
        signature: raw.signature.into_vec(),
        signer_id,
        signature_error,
    })
}

/// Decodes only the `PreviousID` link of an advertisement block.
pub fn previous_link(id: &Cid, data: &[u8]) -> Result<Option<Cid>, SchemaError> {
    Ok(decode_raw_ad(id.codec(), data)?.previous_id)
}

/// Decodes an entry chunk block by the codec of its CID.
pub fn decode_entry_chunk(id: &Cid, data: &[u8]) -> Result<EntryChunk, SchemaError> {
    let raw: RawEntryChunk = match id.codec() {
        DAG_CBOR => serde_ipld_dagcbor::from_slice(data)
            .map_err(|e| SchemaError::MalformedEntryChunk(e.to_string()))?,
        DAG_JSON => serde_ipld_dagjson::from_slice(data)
            .map_err(|e| SchemaError::MalformedEntryChunk(e.to_string()))?,
        other => return Err(SchemaError::UnsupportedCodec(other)),
    };

    let mut entries = Vec::with_capacity(raw.entries.len());
    for mh in raw.entries {
        entries.push(
            Multihash::from_bytes(&mh)
                .map_err(|e| SchemaError::MalformedEntryChunk(format!("bad multihash: {e}")))?,
        );
    }
    Ok(EntryChunk {
        entries,
        next: raw.next,
    })
}

//
// Signature envelope
//
// The signature field holds a protobuf-encoded signed envelope: the signer's
// public key, a payload type, the payload (a sha2-256 multihash over the
// advertisement's identifying fields), and a signature over the
// length-prefixed concatenation of domain, payload type and payload.
//

#[derive(Clone, PartialEq, prost::Message)]
struct EnvelopeProto {
    #[prost(bytes = "vec", tag = "1")]
    public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    payload_type: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    payload: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    signature: Vec<u8>,
}

fn sig_payload(ad: &RawAdvertisement) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(prev) = &ad.previous_id {
        buf.extend_from_slice(&prev.to_bytes());
    }
    buf.extend_from_slice(&ad.entries.to_bytes());
    buf.extend_from_slice(ad.provider.as_bytes());
    buf.extend_from_slice(&ad.context_id);
    buf.extend_from_slice(&ad.metadata);
    buf.push(ad.is_rm as u8);

    let digest = Sha256::digest(&buf);
    Multihash::wrap(SHA2_256, &digest)
        .expect("sha2-256 digest length is valid")
        .to_bytes()
}

fn unsigned_envelope(payload_type: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    for field in [SIG_DOMAIN, payload_type, payload] {
        prost::encoding::encode_varint(field.len() as u64, &mut buf);
        buf.extend_from_slice(field);
    }
    buf
}

/// Verifies the advertisement signature, returning the signer identity and
/// the validation error, if any.
pub fn verify_signature(ad: &RawAdvertisement) -> (Option<PeerId>, Option<SigError>) {
    let envelope = match <EnvelopeProto as prost::Message>::decode(ad.signature.as_slice()) {
        Ok(env) => env,
        Err(e) => return (None, Some(SigError::Envelope(e.to_string()))),
    };

    let public_key = match PublicKey::try_decode_protobuf(&envelope.public_key) {
        Ok(pk) => pk,
        Err(e) => return (None, Some(SigError::Key(e.to_string()))),
    };
    let signer = public_key.to_peer_id();

    if envelope.payload_type != SIG_CODEC {
        return (Some(signer), Some(SigError::WrongPayloadType));
    }
    if envelope.payload != sig_payload(ad) {
        return (Some(signer), Some(SigError::PayloadMismatch));
    }

    let unsigned = unsigned_envelope(&envelope.payload_type, &envelope.payload);
    if !public_key.verify(&unsigned, &envelope.signature) {
        return (Some(signer), Some(SigError::Invalid));
    }
    (Some(signer), None)
}

/// Produces a signature envelope for `ad` (its `signature` field is ignored).
///
/// Used by fixtures and by anything that publishes advertisements.
pub fn sign_advertisement(ad: &RawAdvertisement, key: &Keypair) -> Result<Vec<u8>, SigError> {
    let payload = sig_payload(ad);
    let unsigned = unsigned_envelope(SIG_CODEC, &payload);
    let signature = key
        .sign(&unsigned)
        .map_err(|e| SigError::Signing(e.to_string()))?;

    let envelope = EnvelopeProto {
        public_key: key.public().encode_protobuf(),
        payload_type: SIG_CODEC.to_vec(),
        payload,
        signature,
    };
    Ok(prost::Message::encode_to_vec(&envelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_ad(key: &Keypair, previous: Option<Cid>, is_rm: bool) -> RawAdvertisement {
        let mut ad = RawAdvertisement {
            previous_id: previous,
            provider: key.public().to_peer_id().to_string(),
            addresses: vec!["/ip4/127.0.0.1/tcp/9999".into()],
            signature: ByteBuf::new(),
            entries: no_entries_cid(),
            context_id: ByteBuf::from(b"ctx-1".to_vec()),
            metadata: ByteBuf::from(vec![0x90, 0x0d]),
            is_rm,
            extended_provider: None,
        };
        ad.signature = ByteBuf::from(sign_advertisement(&ad, key).unwrap());
        ad
    }

    #[test]
    fn no_entries_cid_parses() {
        let c = no_entries_cid();
        assert_eq!(c.to_string(), NO_ENTRIES_STR);
        assert!(!is_entries_present(&c));
    }

    #[test]
    fn block_cid_round_trip() {
        let data = b"some block";
        let cid = block_cid(data, DAG_CBOR);
        verify_block(&cid, data).unwrap();
        assert!(matches!(
            verify_block(&cid, b"other bytes"),
            Err(SchemaError::HashMismatch { .. })
        ));
    }

    #[test]
    fn ad_cbor_round_trip_preserves_cid() {
        let key = Keypair::generate_ed25519();
        let raw = signed_ad(&key, None, false);

        let bytes = encode_advertisement(&raw, DAG_CBOR).unwrap();
        let cid = block_cid(&bytes, DAG_CBOR);

        let ad = decode_advertisement(&cid, &bytes).unwrap();
        assert_eq!(ad.id, cid);
        assert_eq!(ad.provider_id, key.public().to_peer_id());
        assert!(ad.previous_id.is_none());
        assert!(!ad.has_entries());
        assert!(ad.signature_error.is_none());
        assert_eq!(ad.signer_id, Some(key.public().to_peer_id()));

        // Re-encoding the decoded fields reproduces the block, so the CID.
        let raw2 = decode_raw_ad(DAG_CBOR, &bytes).unwrap();
        let bytes2 = encode_advertisement(&raw2, DAG_CBOR).unwrap();
        assert_eq!(block_cid(&bytes2, DAG_CBOR), cid);
    }

    #[test]
    fn ad_dag_json_decodes() {
        let key = Keypair::generate_ed25519();
        let raw = signed_ad(&key, None, true);
        let bytes = encode_advertisement(&raw, DAG_JSON).unwrap();
        let cid = block_cid(&bytes, DAG_JSON);

        let ad = decode_advertisement(&cid, &bytes).unwrap();
        assert!(ad.is_remove);
        assert!(ad.signature_error.is_none());
    }

    #[test]
    fn unsupported_codec_rejected() {
        let cid = block_cid(b"raw", 0x55);
        assert!(matches!(
            decode_advertisement(&cid, b"raw"),
            Err(SchemaError::UnsupportedCodec(0x55))
        ));
    }

    #[test]
    fn tampered_ad_fails_signature() {
        let key = Keypair::generate_ed25519();
        let mut raw = signed_ad(&key, None, false);
        raw.context_id = ByteBuf::from(b"ctx-2".to_vec());

        let (signer, err) = verify_signature(&raw);
        assert_eq!(signer, Some(key.public().to_peer_id()));
        assert_eq!(err, Some(SigError::PayloadMismatch));

        // The decode still succeeds and carries the error.
        let bytes = encode_advertisement(&raw, DAG_CBOR).unwrap();
        let cid = block_cid(&bytes, DAG_CBOR);
        let ad = decode_advertisement(&cid, &bytes).unwrap();
        assert_eq!(ad.signature_error, Some(SigError::PayloadMismatch));
    }

    #[test]
    fn garbage_signature_is_envelope_error() {
        let key = Keypair::generate_ed25519();
        let mut raw = signed_ad(&key, None, false);
        raw.signature = ByteBuf::from(vec![0xff; 12]);
        let (_, err) = verify_signature(&raw);
        assert!(matches!(err, Some(SigError::Envelope(_))));
    }

    #[test]
    fn entry_chunk_round_trip() {
        let mhs: Vec<ByteBuf> = (0u8..4)
            .map(|i| {
                let digest = Sha256::digest([i]);
                ByteBuf::from(
                    Multihash::wrap(SHA2_256, &digest)
                        .unwrap()
                        .to_bytes(),
                )
            })
            .collect();
        let next = block_cid(b"next chunk", DAG_CBOR);
        let raw = RawEntryChunk {
            entries: mhs.clone(),
            next: Some(next),
        };

        let bytes = encode_entry_chunk(&raw).unwrap();
        let cid = block_cid(&bytes, DAG_CBOR);
        let chunk = decode_entry_chunk(&cid, &bytes).unwrap();

        assert_eq!(chunk.next, Some(next));
        assert_eq!(chunk.entries.len(), 4);
        for (got, want) in chunk.entries.iter().zip(mhs.iter()) {
            assert_eq!(got.to_bytes(), want.to_vec());
        }
    }

    #[test]
    fn chunk_without_next_terminates() {
        let raw = RawEntryChunk {
            entries: vec![],
            next: None,
        };
        let bytes = encode_entry_chunk(&raw).unwrap();
        let cid = block_cid(&bytes, DAG_CBOR);
        let chunk = decode_entry_chunk(&cid, &bytes).unwrap();
        assert!(chunk.next.is_none());
        assert!(chunk.entries.is_empty());
    }
}
