//! Ingest verification
//!
//! Samples multihashes from a publisher's advertisements (or a CAR source),
//! asks an indexer for them in batches, and classifies every checked
//! multihash into exactly one bucket. A run passes when every checked
//! multihash is indexed under the expected provider.

use std::collections::HashMap;
use std::path::Path;

use cid::Cid;
use libp2p::PeerId;
use multihash::Multihash;
use tracing::{debug, warn};

use crate::car::{self, CarError};
use crate::client::{ClientError, PublisherClient};
use crate::entries::{EntriesError, EntriesIterator};
use crate::find::{FindClient, FindResponse};
use crate::sampler::Sampler;
use crate::schema::Advertisement;

/// Default multihashes per find request.
pub const DEFAULT_BATCH_SIZE: usize = 4096;

#[derive(Clone)]
pub struct VerifyConfig {
    /// Multihashes per find request.
    pub batch_size: usize,
    /// Advertisements to walk from the start CID; 0 means until the chain
    /// tail.
    pub ad_depth_limit: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            ad_depth_limit: 1,
        }
    }
}

/// Outcome of one advertisement's sampling pass.
#[derive(Debug, Default, Clone)]
pub struct AdSample {
    pub ad_id: Option<Cid>,
    pub is_remove: bool,
    /// The ad's context was retracted by a newer removal ad; its content is
    /// no longer provided and was not sampled.
    pub no_longer_provided: bool,
    pub partially_synced: bool,
    pub sync_err: Option<String>,
    pub chunk_count: usize,
    pub mh_count: usize,
    pub mh_sample: Vec<Multihash>,
}

/// Aggregate statistics over a walked advertisement chain.
pub struct AdStats {
    sampler: Sampler,
    pub rm_count: usize,
    pub non_rm_count: usize,
    pub no_longer_provided_count: usize,
    ctx_removed: HashMap<Vec<u8>, bool>,
    mh_counts: Vec<f64>,
    chunk_counts: Vec<f64>,
}

impl AdStats {
    pub fn new(sampler: Sampler) -> Self {
        Self {
            sampler,
            rm_count: 0,
            non_rm_count: 0,
            no_longer_provided_count: 0,
            ctx_removed: HashMap::new(),
            mh_counts: Vec::new(),
            chunk_counts: Vec::new(),
        }
    }

    /// Samples one advertisement, in newest-to-oldest walk order.
    ///
    /// A removal ad marks its context as retracted; any older non-removal
    /// ad for a retracted context is reported as no longer provided and its
    /// entries are not sampled.
    pub fn sample(
        &mut self,
        ad: &Advertisement,
        entries: Option<&mut EntriesIterator>,
    ) -> AdSample {
        let mut sample = AdSample {
            ad_id: Some(ad.id),
            is_remove: ad.is_remove,
            ..AdSample::default()
        };

        if ad.is_remove {
            self.rm_count += 1;
            self.ctx_removed.insert(ad.context_id.clone(), true);
            return sample;
        }

        self.non_rm_count += 1;
        if self.ctx_removed.get(&ad.context_id) == Some(&true) {
            sample.no_longer_provided = true;
            self.no_longer_provided_count += 1;
            return sample;
        }
        self.ctx_removed.insert(ad.context_id.clone(), false);

        let iter = match entries {
            Some(iter) if iter.is_present() => iter,
            _ => return sample,
        };

        let (mhs, err) = iter.drain();
        if let Some(e) = err {
            sample.partially_synced = true;
            sample.sync_err = Some(match e {
                EntriesError::NotSynced(_) => "recursion limit reached".to_string(),
                other => other.to_string(),
            });
        }
        sample.mh_count = mhs.len();
        sample.chunk_count = iter.chunk_count();
        for mh in mhs {
            if (self.sampler)() {
                sample.mh_sample.push(mh);
            }
        }

        self.mh_counts.push(sample.mh_count as f64);
        self.chunk_counts.push(sample.chunk_count as f64);
        sample
    }

    pub fn total_ad_count(&self) -> usize {
        self.rm_count + self.non_rm_count
    }

    pub fn unique_context_id_count(&self) -> usize {
        self.ctx_removed.len()
    }

    /// Multihashes-per-ad summary over non-removal ads.
    pub fn mh_stats(&self) -> SummaryStats {
        SummaryStats::of(&self.mh_counts)
    }

    /// Chunks-per-ad summary over non-removal ads.
    pub fn chunk_stats(&self) -> SummaryStats {
        SummaryStats::of(&self.chunk_counts)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SummaryStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub sum: f64,
}

impl SummaryStats {
    fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sum: f64 = values.iter().sum();
        let mean = sum / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        Self {
            min: values.iter().cloned().fold(f64::INFINITY, f64::min),
            max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            mean,
            std_dev: variance.sqrt(),
            sum,
        }
    }
}

/// Classification buckets of one verification run. Every checked multihash
/// lands in exactly one bucket, so the buckets sum to `total_checked`.
#[derive(Debug, Default, Clone)]
pub struct VerifyResult {
    pub total_checked: usize,
    pub present: usize,
    pub provider_mismatch: usize,
    pub absent: usize,
    pub failed_to_verify: usize,
    pub errs: Vec<String>,
    pub absent_mhs: Vec<Multihash>,
}

impl VerifyResult {
    /// True when every checked multihash is indexed under the expected
    /// provider.
    pub fn passed(&self) -> bool {
        self.present == self.total_checked
    }

    pub fn merge(&mut self, other: VerifyResult) {
        self.total_checked += other.total_checked;
        self.present += other.present;
        self.provider_mismatch += other.provider_mismatch;
        self.absent += other.absent;
        self.failed_to_verify += other.failed_to_verify;
        self.errs.extend(other.errs);
        self.absent_mhs.extend(other.absent_mhs);
    }
}

fn classify(resp: &FindResponse, expected: &PeerId, mhs: &[Multihash]) -> VerifyResult {
    let mut result = VerifyResult {
        total_checked: mhs.len(),
        ..VerifyResult::default()
    };

    if resp.multihash_results.is_empty() {
        result.absent = mhs.len();
        return result;
    }

    let by_mh: HashMap<Vec<u8>, &crate::find::MultihashResult> = resp
        .multihash_results
        .iter()
        .map(|r| (r.multihash.to_bytes(), r))
        .collect();

    for mh in mhs {
        match by_mh.get(&mh.to_bytes()) {
            None => {
                result.absent += 1;
                result.absent_mhs.push(*mh);
            }
            Some(found) if found.provider_results.is_empty() => {
                result.absent += 1;
                result.absent_mhs.push(*mh);
            }
            Some(found) => {
                let matched = found
                    .provider_results
                    .iter()
                    .any(|p| p.provider.id == *expected);
                if matched {
                    result.present += 1;
                } else {
                    result.provider_mismatch += 1;
                }
            }
        }
    }
    result
}

/// Checks `mhs` against the indexer in batches. Transport failures put the
/// whole batch into `failed_to_verify` rather than aborting the run.
pub async fn verify_multihashes(
    find: &FindClient,
    expected: &PeerId,
    mhs: &[Multihash],
    batch_size: usize,
) -> VerifyResult {
    let batch = if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    };

    let mut agg = VerifyResult::default();
    for chunk in mhs.chunks(batch) {
        match find.find_batch(chunk).await {
            Ok(resp) => agg.merge(classify(&resp, expected, chunk)),
            Err(e) => {
                agg.total_checked += chunk.len();
                agg.failed_to_verify += chunk.len();
                agg.errs.push(format!("failed to connect to indexer: {e}"));
            }
        }
    }
    agg
}

/// Walks the advertisement chain from `start` (head when `None`), samples
/// each ad's entries and verifies them against the indexer. `on_ad` receives
/// every ad's sample as the walk proceeds.
pub async fn verify_from_publisher(
    client: &PublisherClient,
    find: &FindClient,
    expected_provider: &PeerId,
    start: Option<Cid>,
    cfg: &VerifyConfig,
    stats: &mut AdStats,
    mut on_ad: impl FnMut(&AdSample),
) -> Result<VerifyResult, ClientError> {
    let mut ad_cid = start;
    let mut agg = VerifyResult::default();
    let mut walked: u64 = 0;

    loop {
        walked += 1;
        let ad = client.get_advertisement(ad_cid).await?;
        debug!(ad = %ad.id, previous = ?ad.previous_id, "verifying ingest");

        if ad.is_remove || !ad.has_entries() {
            let sample = stats.sample(&ad, None);
            on_ad(&sample);
        } else {
            // Entries are semantically irrelevant on removal ads, so only
            // non-removal ads reach this sync.
            if let Some(root) = ad.entries {
                if let Err(e) = client.sync_entries_with_retry(root).await {
                    warn!(ad = %ad.id, error = %e, "failed to sync entries");
                }
            }
            let sample = match client.entries(&ad) {
                Some(mut iter) => stats.sample(&ad, Some(&mut iter)),
                None => stats.sample(&ad, None),
            };
            if !sample.no_longer_provided && !sample.mh_sample.is_empty() {
                let result = verify_multihashes(
                    find,
                    expected_provider,
                    &sample.mh_sample,
                    cfg.batch_size,
                )
                .await;
                agg.merge(result);
            }
            on_ad(&sample);
        }

        if cfg.ad_depth_limit != 0 && walked >= cfg.ad_depth_limit {
            break;
        }
        match ad.previous_id {
            Some(prev) => ad_cid = Some(prev),
            None => break,
        }
    }
    Ok(agg)
}

/// Verifies multihashes extracted from a CAR file's payload.
pub async fn verify_from_car(
    find: &FindClient,
    expected: &PeerId,
    path: &Path,
    sampler: &mut Sampler,
    batch_size: usize,
) -> Result<VerifyResult, CarError> {
    let mhs: Vec<Multihash> = car::car_multihashes(path)
        .await?
        .into_iter()
        .filter(|_| sampler())
        .collect();
    Ok(verify_multihashes(find, expected, &mhs, batch_size).await)
}

/// Verifies multihashes read from a CARv2 iterable multihash index.
pub async fn verify_from_car_index(
    find: &FindClient,
    expected: &PeerId,
    path: &Path,
    sampler: &mut Sampler,
    batch_size: usize,
) -> Result<VerifyResult, CarError> {
    let mhs: Vec<Multihash> = car::car_index_multihashes(path)
        .await?
        .into_iter()
        .filter(|_| sampler())
        .collect();
    Ok(verify_multihashes(find, expected, &mhs, batch_size).await)
}
