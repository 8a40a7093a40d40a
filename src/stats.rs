//! Per-peer transport telemetry.
//!
//! Each peer session runs one sampler task that collects the transport's
//! statistics report once per second, converts the cumulative data-channel
//! counters into deltas and publishes the result as a `peer_stats` event.
//! Teardown publishes one final sample flagged as disconnected.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time};

use crate::{
    ipaddr::{self, IpScope, IpVersion},
    signaling::{event, SignalingClient},
    transport::{PeerConnection, TransportStats},
    PeerId,
};

/// Remembers the previous sample's cumulative counters so the published
/// values are rates. Shared between the sampler task and the final
/// post-teardown sample.
#[derive(Default)]
pub(crate) struct StatsTracker {
    prev_sent: AtomicU64,
    prev_received: AtomicU64,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One `peer_stats` publication.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct PeerStatsSample {
    pub peer_id: PeerId,
    /// Round-trip time of the selected candidate pair in milliseconds, or -1
    /// when no pair has succeeded yet.
    pub rtt: f64,
    #[serde(rename = "bytesSent")]
    pub bytes_sent: u64,
    #[serde(rename = "bytesReceived")]
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_private_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_private_ipv4: Option<String>,
    #[serde(rename = "isDisconnected")]
    pub is_disconnected: bool,
}

/// Derives a publishable sample from a raw transport report, updating the
/// tracker's counters in the process.
pub(crate) fn derive_sample(
    peer_id: &str,
    stats: &TransportStats,
    tracker: &StatsTracker,
    is_disconnected: bool,
) -> PeerStatsSample {
    let rtt = stats.rtt.map(|rtt| rtt * 1000.0).unwrap_or(-1.0);

    let prev_sent = tracker.prev_sent.swap(stats.bytes_sent, Ordering::Relaxed);
    let prev_received = tracker
        .prev_received
        .swap(stats.bytes_received, Ordering::Relaxed);

    let (local_ipv4, local_ipv6, local_private_ipv4) =
        split_candidates(&stats.local_candidates);
    let (remote_ipv4, remote_ipv6, remote_private_ipv4) =
        split_candidates(&stats.remote_candidates);

    PeerStatsSample {
        peer_id: peer_id.to_string(),
        rtt,
        bytes_sent: stats.bytes_sent.saturating_sub(prev_sent),
        bytes_received: stats.bytes_received.saturating_sub(prev_received),
        local_ipv4,
        local_ipv6,
        local_private_ipv4,
        remote_ipv4,
        remote_ipv6,
        remote_private_ipv4,
        is_disconnected,
    }
}

/// Buckets candidate IP literals into (public v4, public v6, private v4).
/// The first candidate of each kind wins; private v6 endpoints have no slot
/// in the sample and are dropped.
fn split_candidates(candidates: &[String]) -> (Option<String>, Option<String>, Option<String>) {
    let mut public_v4 = None;
    let mut public_v6 = None;
    let mut private_v4 = None;
    for candidate in candidates {
        match ipaddr::classify_str(candidate) {
            Some((IpVersion::V4, IpScope::Public)) => {
                if public_v4.is_none() {
                    public_v4 = Some(candidate.clone());
                }
            }
            Some((IpVersion::V4, IpScope::Private)) => {
                if private_v4.is_none() {
                    private_v4 = Some(candidate.clone());
                }
            }
            Some((IpVersion::V6, IpScope::Public)) => {
                if public_v6.is_none() {
                    public_v6 = Some(candidate.clone());
                }
            }
            Some((IpVersion::V6, IpScope::Private)) => {}
            None => log::trace!("Unclassifiable candidate {:?}", candidate),
        }
    }
    (public_v4, public_v6, private_v4)
}

/// Spawns the once-per-second sampler for a peer.
pub(crate) fn spawn_sampler(
    signaling: Arc<SignalingClient>,
    peer_id: PeerId,
    conn: Arc<dyn PeerConnection>,
    tracker: Arc<StatsTracker>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let stats = conn.stats().await;
            let sample = derive_sample(&peer_id, &stats, &tracker, false);
            signaling.emit(event::PEER_STATS, &sample);
        }
    })
}

/// Publishes the final sample of a peer after its teardown. The sampler task
/// must already be stopped so this sample is the last one the sink sees.
pub(crate) async fn publish_final(
    signaling: &SignalingClient,
    peer_id: &str,
    conn: &Arc<dyn PeerConnection>,
    tracker: &StatsTracker,
) {
    let stats = conn.stats().await;
    let sample = derive_sample(peer_id, &stats, tracker, true);
    signaling.emit(event::PEER_STATS, &sample);
}
