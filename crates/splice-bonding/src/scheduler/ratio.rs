//! Client-side splice control: measure what each source delivers per
//! window, turn the counts into new ratios, and push them to the sources
//! until every participating source has acknowledged the switch.

use quanta::Instant;
use splice_transport::arq::is_starved;
use splice_transport::wire::{SpliceUpdate, SOURCE_COUNT};
use tracing::{debug, info, warn};

use super::bucket::equal_ratios;
use crate::config::SpliceTuning;

/// Turn per-source packet counts into weights summing (up to rounding) to
/// `frame`. Returns `None` when nothing was counted.
///
/// Each weight is rounded independently, so the sum can drift from `frame`
/// by at most 2. The drift is logged and left uncorrected.
pub fn compute_weights(counts: &[u64; SOURCE_COUNT], frame: u8) -> Option<[u8; SOURCE_COUNT]> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return None;
    }
    let weights: [u8; SOURCE_COUNT] = std::array::from_fn(|i| {
        let share = counts[i] as f64 / total as f64;
        (share * f64::from(frame)).round() as u8
    });
    let sum: u32 = weights.iter().map(|&w| u32::from(w)).sum();
    if sum != u32::from(frame) {
        warn!(sum, frame, ?weights, "splice weights drift from frame size");
    }
    Some(weights)
}

/// `Σ |a[i] − b[i]|`.
pub fn ratio_change(a: &[u8; SOURCE_COUNT], b: &[u8; SOURCE_COUNT]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| u32::from(x.abs_diff(y)))
        .sum()
}

#[derive(Debug, Clone, Copy)]
struct PendingPush {
    update: SpliceUpdate,
    sent_at: Instant,
}

/// Snapshot of controller counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub pushes: u64,
    pub retries: u64,
    pub commits: u64,
}

/// Client-side splice ratio controller.
///
/// Counts DATA arrivals per source over a measurement window. When a window
/// closes the arrival shares become the next weight vector; if it moved far
/// enough from the previous one and no push is in flight, a new
/// [`SpliceUpdate`] is produced for broadcast. The push stays in flight until
/// every source that is neither starved nor refused has acknowledged it; an
/// ack timeout recomputes and re-sends.
pub struct SpliceController {
    tuning: SpliceTuning,
    /// Sources that accepted the request. The others never ack.
    active: [bool; SOURCE_COUNT],
    counts: [u64; SOURCE_COUNT],
    window_start: Option<Instant>,
    previous: Option<[u8; SOURCE_COUNT]>,
    /// Last vector sent to the sources.
    current: [u8; SOURCE_COUNT],
    acked: [bool; SOURCE_COUNT],
    pending: Option<PendingPush>,
    last_seq: u32,
    stats: SpliceStats,
}

impl SpliceController {
    pub fn new(tuning: SpliceTuning, active: [bool; SOURCE_COUNT]) -> Self {
        Self {
            current: equal_ratios(tuning.frame),
            tuning,
            active,
            counts: [0; SOURCE_COUNT],
            window_start: None,
            previous: None,
            acked: [true; SOURCE_COUNT],
            pending: None,
            last_seq: 0,
            stats: SpliceStats::default(),
        }
    }

    /// Ratios most recently pushed to the sources.
    pub fn current_ratios(&self) -> [u8; SOURCE_COUNT] {
        self.current
    }

    /// True when no push is waiting for acknowledgements.
    pub fn all_acked(&self) -> bool {
        self.pending.is_none()
    }

    pub fn pending_update(&self) -> Option<SpliceUpdate> {
        self.pending.map(|p| p.update)
    }

    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    pub fn get_stats(&self) -> SpliceStats {
        self.stats.clone()
    }

    /// Count one DATA packet. Returns an update to broadcast when this
    /// arrival closes a window that warrants a ratio change.
    pub fn record_data(&mut self, src: u8, seq: u32, now: Instant) -> Option<SpliceUpdate> {
        let slot = self.counts.get_mut(src as usize)?;
        *slot += 1;
        self.last_seq = self.last_seq.max(seq);

        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return None;
        };
        if now.duration_since(start) <= self.tuning.delay {
            return None;
        }
        self.window_start = Some(now);

        let weights = self.take_weights()?;
        let Some(previous) = self.previous.replace(weights) else {
            debug!(?weights, "first splice measurement");
            return None;
        };
        let change = ratio_change(&weights, &previous);
        debug!(?weights, change, "splice window closed");
        if change >= self.tuning.threshold && self.all_acked() {
            info!(change, ?weights, "ratio change over threshold, pushing splice update");
            return Some(self.begin_push(weights, now));
        }
        None
    }

    /// Record a SPLICE_ACK. Returns `true` when it completes the quorum.
    pub fn on_ack(&mut self, src: u8, sseq: u32) -> bool {
        let Some(pending) = self.pending else {
            debug!(src, sseq, "splice ack with nothing in flight");
            return false;
        };
        if pending.update.sseq != sseq {
            debug!(src, sseq, expected = pending.update.sseq, "ack for an older splice push");
            return false;
        }
        let Some(slot) = self.acked.get_mut(src as usize) else {
            return false;
        };
        *slot = true;
        self.check_quorum()
    }

    /// Re-send after the ack timeout. Ratios are recomputed from the counts
    /// gathered since the last window; with no arrivals the in-flight vector
    /// is re-sent with a fresh switchover sequence.
    pub fn poll_ack_timeout(&mut self, now: Instant) -> Option<SpliceUpdate> {
        let pending = self.pending?;
        if now.duration_since(pending.sent_at) <= self.tuning.ack_timeout() {
            return None;
        }
        warn!(sseq = pending.update.sseq, acked = ?self.acked, "splice ack timeout, resending ratios");
        self.window_start = Some(now);
        let weights = self.take_weights().unwrap_or(pending.update.ratios);
        self.previous = Some(weights);
        self.stats.retries += 1;
        Some(self.begin_push(weights, now))
    }

    fn take_weights(&mut self) -> Option<[u8; SOURCE_COUNT]> {
        let weights = compute_weights(&self.counts, self.tuning.frame);
        self.counts = [0; SOURCE_COUNT];
        weights
    }

    fn is_exempt(&self, src: usize, weights: &[u8; SOURCE_COUNT]) -> bool {
        !self.active[src]
            || is_starved(weights[src], self.tuning.frame, self.tuning.ignore_divisor)
    }

    fn begin_push(&mut self, weights: [u8; SOURCE_COUNT], now: Instant) -> SpliceUpdate {
        let update = SpliceUpdate {
            sseq: self.last_seq.saturating_add(self.tuning.gap),
            ratios: weights,
        };
        for src in 0..SOURCE_COUNT {
            self.acked[src] = self.is_exempt(src, &weights);
        }
        self.current = weights;
        self.pending = Some(PendingPush {
            update,
            sent_at: now,
        });
        self.stats.pushes += 1;
        self.check_quorum();
        update
    }

    fn check_quorum(&mut self) -> bool {
        if self.pending.is_some() && self.acked.iter().all(|&a| a) {
            if let Some(done) = self.pending.take() {
                info!(sseq = done.update.sseq, ratios = ?done.update.ratios, "splice update acknowledged");
            }
            self.stats.commits += 1;
            return true;
        }
        false
    }
}
