//! Distance tracking
//!
//! Periodically measures, per provider, how far an indexer's last-seen
//! advertisement lags behind the publisher's head. Emissions are
//! change-only: distances are sent when they move, errors only when their
//! kind changes, so the channel stays quiet during steady state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use libp2p::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::distance::{AdDistance, DistanceConfig, DistanceError};
use crate::pcache::ProviderCache;

#[derive(Clone)]
pub struct TrackerConfig {
    /// Time between polling rounds.
    pub update_interval: Duration,
    /// Bound on a single provider's update; `None` leaves it unbounded.
    /// Expiry counts as an update error, not termination.
    pub update_timeout: Option<Duration>,
    /// Distance engine configuration shared by all tracked providers.
    pub distance: DistanceConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(120),
            update_timeout: None,
            distance: DistanceConfig::default(),
        }
    }
}

/// A change in a provider's tracked state.
#[derive(Debug, Clone)]
pub struct DistanceUpdate {
    pub provider: PeerId,
    /// Ad count behind head; `-1` when the depth limit was exceeded.
    /// Meaningless when `err` is set.
    pub distance: i64,
    pub err: Option<TrackError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
    #[error("provider not found")]
    NotFound,

    #[error("provider never synced")]
    NeverSynced,

    #[error("no advertisement publisher")]
    NoPublisher,

    #[error("cannot get distance update: {0}")]
    Update(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrKind {
    None,
    NotFound,
    NeverSynced,
    NoPublisher,
    Update,
}

struct DistTrack {
    dist: i64,
    head: Option<Cid>,
    ad: Option<Cid>,
    err_kind: ErrKind,
}

impl Default for DistTrack {
    fn default() -> Self {
        Self {
            dist: 0,
            head: None,
            ad: None,
            err_kind: ErrKind::None,
        }
    }
}

/// Starts the tracker and returns its update stream.
///
/// An empty `include` set tracks every provider visible in the cache;
/// `exclude` always applies. The tracker stops, closing the channel, when
/// the receiver is dropped or a cache refresh fails.
pub fn run_distance_tracker(
    include: HashSet<PeerId>,
    exclude: HashSet<PeerId>,
    cache: Arc<dyn ProviderCache>,
    cfg: TrackerConfig,
) -> Result<mpsc::Receiver<DistanceUpdate>, DistanceError> {
    let engine = AdDistance::new(cfg.distance.clone())?;
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run(include, exclude, cache, cfg, engine, tx));
    Ok(rx)
}

async fn run(
    include: HashSet<PeerId>,
    exclude: HashSet<PeerId>,
    cache: Arc<dyn ProviderCache>,
    cfg: TrackerConfig,
    engine: AdDistance,
    tx: mpsc::Sender<DistanceUpdate>,
) {
    let look_for_new = include.is_empty();
    let mut tracks: HashMap<PeerId, DistTrack> = include
        .into_iter()
        .filter(|pid| !exclude.contains(pid))
        .map(|pid| (pid, DistTrack::default()))
        .collect();

    loop {
        if let Err(e) = cache.refresh().await {
            warn!(error = %e, "provider cache refresh failed; stopping tracker");
            break;
        }

        if look_for_new {
            for pinfo in cache.list().await {
                let pid = pinfo.addr_info.id;
                if !exclude.contains(&pid) {
                    tracks.entry(pid).or_default();
                }
            }
        }

        // One provider at a time, so a busy tracker does not overwhelm
        // publishers.
        for (pid, track) in tracks.iter_mut() {
            if tx.is_closed() {
                engine.close().await;
                return;
            }

            let update = match cfg.update_timeout {
                Some(t) => {
                    match tokio::time::timeout(t, update_track(*pid, track, &*cache, &engine))
                        .await
                    {
                        Ok(u) => u,
                        Err(_) => edge(
                            *pid,
                            track,
                            ErrKind::Update,
                            TrackError::Update("update timed out".into()),
                        ),
                    }
                }
                None => update_track(*pid, track, &*cache, &engine).await,
            };

            if let Some(update) = update {
                if tx.send(update).await.is_err() {
                    engine.close().await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = tx.closed() => break,
            _ = tokio::time::sleep(cfg.update_interval) => {}
        }
    }
    engine.close().await;
}

fn edge(
    pid: PeerId,
    track: &mut DistTrack,
    kind: ErrKind,
    err: TrackError,
) -> Option<DistanceUpdate> {
    if track.err_kind == kind {
        return None;
    }
    track.err_kind = kind;
    debug!(provider = %pid, ?err, "track error transition");
    Some(DistanceUpdate {
        provider: pid,
        distance: 0,
        err: Some(err),
    })
}

async fn update_track(
    pid: PeerId,
    track: &mut DistTrack,
    cache: &dyn ProviderCache,
    engine: &AdDistance,
) -> Option<DistanceUpdate> {
    let pinfo = match cache.get(&pid).await {
        Ok(Some(p)) => p,
        Ok(None) | Err(_) => return edge(pid, track, ErrKind::NotFound, TrackError::NotFound),
    };

    let last_ad = match pinfo.last_advertisement {
        Some(c) => c,
        None => return edge(pid, track, ErrKind::NeverSynced, TrackError::NeverSynced),
    };

    let publisher = match pinfo.publisher_addr_info() {
        Some(p) => p,
        None => return edge(pid, track, ErrKind::NoPublisher, TrackError::NoPublisher),
    };

    let anchor = match track.head {
        Some(head) => head,
        None => {
            // First good observation: measure from head back to the ad the
            // indexer last ingested.
            return match engine.get(&publisher, &last_ad, None).await {
                Err(e) => edge(pid, track, ErrKind::Update, TrackError::Update(e.to_string())),
                Ok((dist, head)) => {
                    track.err_kind = ErrKind::None;
                    track.ad = Some(last_ad);
                    track.dist = dist;
                    // An exceeded walk leaves no anchor to diff against.
                    track.head = if dist == -1 { None } else { Some(head) };
                    Some(DistanceUpdate {
                        provider: pid,
                        distance: dist,
                        err: None,
                    })
                }
            };
        }
    };

    let mut updated = false;

    // How far has the head moved since the last poll?
    let (head_delta, head) = match engine.get(&publisher, &anchor, None).await {
        Err(e) => return edge(pid, track, ErrKind::Update, TrackError::Update(e.to_string())),
        Ok(v) => v,
    };
    track.err_kind = ErrKind::None;
    if head_delta == -1 {
        track.head = None;
        return Some(DistanceUpdate {
            provider: pid,
            distance: -1,
            err: None,
        });
    }
    if head != anchor {
        track.dist += head_delta;
        track.head = Some(head);
        updated = true;
    }

    // How far has the indexer's last-seen ad moved?
    if track.ad != Some(last_ad) {
        if let Some(prev_seen) = track.ad {
            let (seen_delta, _) = match engine.get(&publisher, &prev_seen, Some(last_ad)).await {
                Err(e) => {
                    return edge(pid, track, ErrKind::Update, TrackError::Update(e.to_string()))
                }
                Ok(v) => v,
            };
            track.err_kind = ErrKind::None;
            if seen_delta == -1 {
                track.head = None;
                return Some(DistanceUpdate {
                    provider: pid,
                    distance: -1,
                    err: None,
                });
            }
            track.dist -= seen_delta;
        }
        track.ad = Some(last_ad);
        updated = true;
    }

    if !updated {
        return None;
    }
    Some(DistanceUpdate {
        provider: pid,
        distance: track.dist,
        err: None,
    })
}
