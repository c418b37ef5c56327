//! CAR multihash sources
//!
//! The verifier can take its multihashes from a CAR file instead of a
//! publisher: either by scanning the payload blocks (any CARv1, or the inner
//! payload of a CARv2), or by reading a CARv2 index in the iterable
//! multihash-sorted format.

use std::io::SeekFrom;
use std::path::Path;

use iroh_car::CarReader;
use multihash::Multihash;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::debug;

/// Multicodec of the CARv2 multihash-sorted index.
pub const MULTIHASH_INDEX_SORTED_CODEC: u64 = 0x0401;

/// The fixed 11-byte CARv2 pragma.
const CARV2_PRAGMA: [u8; 11] = [
    0x0a, 0xa1, 0x67, b'v', b'e', b'r', b's', b'i', b'o', b'n', 0x02,
];

/// Byte length of the CARv2 header that follows the pragma.
const CARV2_HEADER_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum CarError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("car: {0}")]
    Car(String),

    #[error("car index: {0}")]
    Index(String),
}

/// Multihashes of every block in a CAR file's payload, in payload order.
///
/// CARv2 files are recognized by their pragma and scanned through their
/// inner CARv1 payload; no pre-existing index is required.
pub async fn car_multihashes(path: &Path) -> Result<Vec<Multihash>, CarError> {
    let mut file = tokio::fs::File::open(path).await?;

    let mut pragma = [0u8; CARV2_PRAGMA.len()];
    file.read_exact(&mut pragma).await?;

    if pragma == CARV2_PRAGMA {
        let mut header = [0u8; CARV2_HEADER_LEN];
        file.read_exact(&mut header).await?;
        // characteristics: 16 bytes, then data offset/size and index offset.
        let data_offset = u64_le(&header, 16);
        let data_size = u64_le(&header, 24);
        debug!(data_offset, data_size, "scanning CARv2 payload");
        file.seek(SeekFrom::Start(data_offset)).await?;
        collect_payload(file.take(data_size)).await
    } else {
        file.seek(SeekFrom::Start(0)).await?;
        collect_payload(file).await
    }
}

async fn collect_payload<R>(reader: R) -> Result<Vec<Multihash>, CarError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut car = CarReader::new(BufReader::new(reader))
        .await
        .map_err(|e| CarError::Car(e.to_string()))?;

    let mut mhs = Vec::new();
    while let Some((cid, _)) = car
        .next_block()
        .await
        .map_err(|e| CarError::Car(e.to_string()))?
    {
        mhs.push(*cid.hash());
    }
    Ok(mhs)
}

/// Multihashes of a CARv2 index file in iterable multihash-sorted format.
pub async fn car_index_multihashes(path: &Path) -> Result<Vec<Multihash>, CarError> {
    let data = tokio::fs::read(path).await?;
    parse_multihash_index(&data)
}

/// The index layout is: uvarint codec, then per multihash code a set of
/// width buckets, each bucket a packed run of `digest ‖ u64 offset` entries
/// of one fixed width.
fn parse_multihash_index(data: &[u8]) -> Result<Vec<Multihash>, CarError> {
    let mut pos = 0usize;

    let codec = read_uvarint(data, &mut pos)?;
    if codec != MULTIHASH_INDEX_SORTED_CODEC {
        return Err(CarError::Index(format!(
            "not an iterable multihash index (codec 0x{codec:x})"
        )));
    }

    let mut mhs = Vec::new();
    let code_count = read_u32_le(data, &mut pos)?;
    for _ in 0..code_count {
        let code = read_u64_le(data, &mut pos)?;
        let width_count = read_u32_le(data, &mut pos)?;
        for _ in 0..width_count {
            let width = read_u32_le(data, &mut pos)? as usize;
            let len = read_u64_le(data, &mut pos)? as usize;
            if width <= 8 || len % width != 0 {
                return Err(CarError::Index(format!(
                    "bad bucket geometry: width {width}, length {len}"
                )));
            }
            let end = pos
                .checked_add(len)
                .filter(|e| *e <= data.len())
                .ok_or_else(|| CarError::Index("truncated entry bucket".into()))?;
            let digest_len = width - 8;
            while pos < end {
                let digest = &data[pos..pos + digest_len];
                mhs.push(
                    Multihash::wrap(code, digest)
                        .map_err(|e| CarError::Index(format!("bad multihash: {e}")))?,
                );
                pos += width;
            }
        }
    }
    Ok(mhs)
}

fn u64_le(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32_le(data: &[u8], pos: &mut usize) -> Result<u32, CarError> {
    if *pos + 4 > data.len() {
        return Err(CarError::Index("truncated index".into()));
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[*pos..*pos + 4]);
    *pos += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64_le(data: &[u8], pos: &mut usize) -> Result<u64, CarError> {
    if *pos + 8 > data.len() {
        return Err(CarError::Index("truncated index".into()));
    }
    let value = u64_le(data, *pos);
    *pos += 8;
    Ok(value)
}

fn read_uvarint(data: &[u8], pos: &mut usize) -> Result<u64, CarError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| CarError::Index("truncated varint".into()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(CarError::Index("varint overflow".into()));
        }
    }
}
