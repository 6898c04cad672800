//! Server-side token-bucket schedule deciding which source owns each
//! sequence number.

use splice_transport::wire::{SpliceUpdate, SOURCE_COUNT};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::receiver::aggregator::FIRST_SEQ;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwitchError {
    #[error("switchover at {sseq} is not ahead of current sequence {current}")]
    Stale { sseq: u32, current: u32 },
    #[error("ratio vector assigns no sequences to any source")]
    EmptyRatios,
}

/// Sequences claimed by each source during one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickClaims {
    pub claims: [Option<u32>; SOURCE_COUNT],
}

impl TickClaims {
    pub fn claimed(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.claims
            .iter()
            .enumerate()
            .filter_map(|(src, seq)| seq.map(|s| (src as u8, s)))
    }
}

/// Equal split of `frame` across the sources; the remainder goes to the
/// lowest ids.
pub fn equal_ratios(frame: u8) -> [u8; SOURCE_COUNT] {
    let share = frame / SOURCE_COUNT as u8;
    let extra = (frame % SOURCE_COUNT as u8) as usize;
    std::array::from_fn(|i| share + u8::from(i < extra))
}

/// Deterministic weighted round robin over the global sequence space.
///
/// Every server runs one of these with the same weights and starting
/// sequence, so all four agree on who owns each sequence without talking to
/// each other. Each tick, every source with a nonzero bucket counter takes
/// one token and claims the next sequence; when all buckets are empty they
/// are refilled from the weight vector.
///
/// Agreement holds only while all servers start in lockstep and apply each
/// switchover at the same boundary.
#[derive(Debug, Clone)]
pub struct SpliceScheduler {
    id: u8,
    weights: [u8; SOURCE_COUNT],
    bucket: [u8; SOURCE_COUNT],
    pending: Option<SpliceUpdate>,
    /// Next global sequence to be claimed.
    seq: u32,
    frame: u8,
}

impl SpliceScheduler {
    pub fn new(id: u8, frame: u8) -> Self {
        Self::with_ratios(id, frame, equal_ratios(frame))
    }

    pub fn with_ratios(id: u8, frame: u8, weights: [u8; SOURCE_COUNT]) -> Self {
        Self {
            id,
            weights,
            bucket: [0; SOURCE_COUNT],
            pending: None,
            seq: FIRST_SEQ,
            frame,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn weights(&self) -> [u8; SOURCE_COUNT] {
        self.weights
    }

    /// The next sequence number any source will claim.
    pub fn current_seq(&self) -> u32 {
        self.seq
    }

    pub fn pending(&self) -> Option<&SpliceUpdate> {
        self.pending.as_ref()
    }

    /// Accept a ratio change to be applied once the sequence counter reaches
    /// `update.sseq`. A newer update replaces one that has not been applied
    /// yet.
    pub fn schedule_switch(&mut self, update: SpliceUpdate) -> Result<(), SwitchError> {
        if update.sseq <= self.seq {
            return Err(SwitchError::Stale {
                sseq: update.sseq,
                current: self.seq,
            });
        }
        if update.ratios.iter().all(|&w| w == 0) {
            return Err(SwitchError::EmptyRatios);
        }
        let sum: u32 = update.ratios.iter().map(|&w| u32::from(w)).sum();
        if sum != u32::from(self.frame) {
            warn!(
                sum,
                frame = self.frame,
                ratios = ?update.ratios,
                "splice ratios do not sum to frame size, applying as sent"
            );
        }
        info!(
            id = self.id,
            sseq = update.sseq,
            ratios = ?update.ratios,
            "splice switch scheduled"
        );
        self.pending = Some(update);
        Ok(())
    }

    fn apply_pending(&mut self) {
        if let Some(update) = self.pending {
            if self.seq >= update.sseq {
                debug!(id = self.id, seq = self.seq, ratios = ?update.ratios, "switching splice ratios");
                self.weights = update.ratios;
                self.pending = None;
            }
        }
    }

    /// Advance one tick and report what every source claimed.
    pub fn tick(&mut self) -> TickClaims {
        self.apply_pending();
        if self.bucket.iter().all(|&b| b == 0) {
            self.bucket = self.weights;
        }
        let mut out = TickClaims::default();
        for (src, tokens) in self.bucket.iter_mut().enumerate() {
            if *tokens > 0 {
                *tokens -= 1;
                out.claims[src] = Some(self.seq);
                self.seq = self.seq.wrapping_add(1);
            }
        }
        out
    }

    /// Advance one tick; returns the sequence this server owns in it, if any.
    pub fn next_owned(&mut self) -> Option<u32> {
        let id = self.id as usize;
        self.tick().claims.get(id).copied().flatten()
    }
}
