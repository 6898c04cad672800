//! # ARQ — targeted retransmission
//!
//! The client's reorder buffer reports holes that have fallen far enough
//! behind the newest received sequence. Each hole becomes one NAK sent to a
//! single source; the source answers with a best-effort resend of that
//! sequence.
//!
//! ## Source selection
//!
//! - Sources whose splice weight is at or below `frame / ignore_divisor` are
//!   considered starved and skipped.
//! - Among the rest, a [`SourceSelector`] picks the target. Round-robin is the
//!   default; a seeded random selector is available for parity with the
//!   reference deployment.
//! - At most `max_per_tick` NAKs are issued per timer tick. Holes left over
//!   are found again on the next scan.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::Deserialize;

use crate::wire::SOURCE_COUNT;

// ─── Starvation ─────────────────────────────────────────────────────────────

/// Highest weight that still counts as starved.
#[inline]
pub fn starvation_limit(frame: u8, ignore_divisor: u8) -> u8 {
    frame / ignore_divisor.max(1)
}

/// A starved source neither serves retransmissions nor blocks a splice ack
/// quorum.
#[inline]
pub fn is_starved(weight: u8, frame: u8, ignore_divisor: u8) -> bool {
    weight <= starvation_limit(frame, ignore_divisor)
}

// ─── Selectors ──────────────────────────────────────────────────────────────

/// Which selector a session builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// Picks the source that should serve one retransmission.
pub trait SourceSelector: Send {
    /// Returns `None` only when no source is eligible.
    fn select(&mut self, eligible: &[bool; SOURCE_COUNT]) -> Option<u8>;
}

/// Cycles through eligible sources in id order.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: usize,
}

impl SourceSelector for RoundRobinSelector {
    fn select(&mut self, eligible: &[bool; SOURCE_COUNT]) -> Option<u8> {
        for step in 0..SOURCE_COUNT {
            let idx = (self.next + step) % SOURCE_COUNT;
            if eligible[idx] {
                self.next = (idx + 1) % SOURCE_COUNT;
                return Some(idx as u8);
            }
        }
        None
    }
}

/// Uniform choice among eligible sources from a seeded generator.
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SourceSelector for RandomSelector {
    fn select(&mut self, eligible: &[bool; SOURCE_COUNT]) -> Option<u8> {
        let candidates: Vec<u8> = (0..SOURCE_COUNT as u8)
            .filter(|&i| eligible[i as usize])
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = self.rng.random_range(0..candidates.len());
        Some(candidates[pick])
    }
}

/// Build the selector named by `strategy`.
pub fn selector_for(strategy: SelectionStrategy, seed: u64) -> Box<dyn SourceSelector> {
    match strategy {
        SelectionStrategy::RoundRobin => Box::new(RoundRobinSelector::default()),
        SelectionStrategy::Random => Box::new(RandomSelector::seeded(seed)),
    }
}

// ─── Planner ────────────────────────────────────────────────────────────────

/// One NAK to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakRequest {
    pub source: u8,
    pub seq: u32,
}

/// Turns lost sequences into addressed NAK requests.
pub struct RetransmitPlanner {
    selector: Box<dyn SourceSelector>,
    frame: u8,
    ignore_divisor: u8,
    max_per_tick: usize,
    requested: u64,
}

impl RetransmitPlanner {
    pub fn new(
        selector: Box<dyn SourceSelector>,
        frame: u8,
        ignore_divisor: u8,
        max_per_tick: usize,
    ) -> Self {
        Self {
            selector,
            frame,
            ignore_divisor,
            max_per_tick: max_per_tick.max(1),
            requested: 0,
        }
    }

    /// Sources allowed to serve retransmissions under `ratios`. If every
    /// source is starved (only possible before the first measurement) all of
    /// them are allowed.
    pub fn eligible(&self, ratios: &[u8; SOURCE_COUNT]) -> [bool; SOURCE_COUNT] {
        let mut eligible = [false; SOURCE_COUNT];
        for (slot, &weight) in eligible.iter_mut().zip(ratios) {
            *slot = !is_starved(weight, self.frame, self.ignore_divisor);
        }
        if eligible.iter().all(|&e| !e) {
            eligible = [true; SOURCE_COUNT];
        }
        eligible
    }

    /// Address up to `max_per_tick` of the `lost` sequences. The iterator is
    /// consumed lazily, so holes beyond the cap stay unscanned.
    pub fn plan<I>(&mut self, lost: I, ratios: &[u8; SOURCE_COUNT]) -> Vec<NakRequest>
    where
        I: IntoIterator<Item = u32>,
    {
        let eligible = self.eligible(ratios);
        let mut out = Vec::new();
        for seq in lost.into_iter().take(self.max_per_tick) {
            if let Some(source) = self.selector.select(&eligible) {
                out.push(NakRequest { source, seq });
            }
        }
        self.requested += out.len() as u64;
        out
    }

    /// Total NAKs planned over the planner's lifetime.
    pub fn requested(&self) -> u64 {
        self.requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starvation_threshold_is_inclusive() {
        assert_eq!(starvation_limit(100, 20), 5);
        assert!(is_starved(5, 100, 20));
        assert!(!is_starved(6, 100, 20));
        assert!(is_starved(0, 100, 20));
    }

    #[test]
    fn round_robin_skips_ineligible() {
        let mut sel = RoundRobinSelector::default();
        let eligible = [true, false, true, true];
        let picks: Vec<u8> = (0..6).filter_map(|_| sel.select(&eligible)).collect();
        assert_eq!(picks, vec![0, 2, 3, 0, 2, 3]);
        assert_eq!(sel.select(&[false; SOURCE_COUNT]), None);
    }

    #[test]
    fn random_selector_is_seeded_and_respects_eligibility() {
        let eligible = [false, true, false, true];
        let mut a = RandomSelector::seeded(7);
        let mut b = RandomSelector::seeded(7);
        let seq_a: Vec<u8> = (0..32).filter_map(|_| a.select(&eligible)).collect();
        let seq_b: Vec<u8> = (0..32).filter_map(|_| b.select(&eligible)).collect();
        assert_eq!(seq_a, seq_b);
        assert!(seq_a.iter().all(|&s| s == 1 || s == 3));
    }

    #[test]
    fn planner_excludes_starved_sources() {
        let mut planner =
            RetransmitPlanner::new(Box::new(RoundRobinSelector::default()), 100, 20, 64);
        let naks = planner.plan([10, 11, 12, 13], &[50, 3, 47, 0]);
        let sources: Vec<u8> = naks.iter().map(|n| n.source).collect();
        assert_eq!(sources, vec![0, 2, 0, 2]);
        let seqs: Vec<u32> = naks.iter().map(|n| n.seq).collect();
        assert_eq!(seqs, vec![10, 11, 12, 13]);
        assert_eq!(planner.requested(), 4);
    }

    #[test]
    fn planner_caps_per_tick() {
        let mut planner =
            RetransmitPlanner::new(Box::new(RoundRobinSelector::default()), 100, 20, 2);
        let mut pulled = 0;
        let lost = (1..=10u32).inspect(|_| pulled += 1);
        let naks = planner.plan(lost, &[25, 25, 25, 25]);
        assert_eq!(naks.len(), 2);
        assert_eq!(pulled, 2);
    }

    #[test]
    fn all_starved_falls_back_to_every_source() {
        let planner = RetransmitPlanner::new(Box::new(RoundRobinSelector::default()), 100, 20, 8);
        assert_eq!(planner.eligible(&[0, 0, 0, 0]), [true; SOURCE_COUNT]);
    }
}
