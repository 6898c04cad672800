//! # Session bookkeeping
//!
//! Pure state shared by the client and server sessions: the four-leg request
//! handshake, the consecutive-error budget and end-of-stream tracking.
//!
//! ```text
//!   REQ×4 ──▶ Requesting ──all non-refused legs acked──▶ Streaming
//!                 │                                          │
//!            all REQNAK                              FIN from every leg
//!                 ▼                                  (or quiet after one)
//!              Failed                                        ▼
//!                                                          Closed
//! ```

use quanta::Instant;
use std::time::Duration;

use crate::wire::{Message, StreamInfo, SOURCE_COUNT};

// ─── Session State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Requests sent, waiting for every leg to answer.
    Requesting,
    Streaming,
    Closed,
    Failed,
}

// ─── Handshake ──────────────────────────────────────────────────────────────

/// State of one request leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Pending,
    Acked,
    Refused,
}

/// Tracks REQUEST_ACK / REQUEST_NAK replies from the four sources.
#[derive(Debug, Clone)]
pub struct Handshake {
    legs: [LegState; SOURCE_COUNT],
    stream: Option<StreamInfo>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            legs: [LegState::Pending; SOURCE_COUNT],
            stream: None,
        }
    }

    /// Record a reply from `src`. Returns `false` if the message is not a
    /// handshake reply or `src` is not a source id.
    pub fn on_reply(&mut self, src: u8, msg: &Message) -> bool {
        let Some(leg) = self.legs.get_mut(src as usize) else {
            return false;
        };
        match msg {
            Message::RequestAck(info) => {
                *leg = LegState::Acked;
                if self.stream.is_none() {
                    self.stream = Some(*info);
                }
                true
            }
            Message::RequestNak => {
                *leg = LegState::Refused;
                true
            }
            _ => false,
        }
    }

    pub fn leg(&self, src: u8) -> Option<LegState> {
        self.legs.get(src as usize).copied()
    }

    pub fn is_acked(&self, src: u8) -> bool {
        self.leg(src) == Some(LegState::Acked)
    }

    /// Every leg answered and at least one accepted.
    pub fn is_complete(&self) -> bool {
        !self.legs.contains(&LegState::Pending) && self.legs.contains(&LegState::Acked)
    }

    pub fn all_refused(&self) -> bool {
        self.legs.iter().all(|&l| l == LegState::Refused)
    }

    /// Sources that accepted the request.
    pub fn active_sources(&self) -> [bool; SOURCE_COUNT] {
        self.legs.map(|l| l == LegState::Acked)
    }

    /// Stream description from the first acknowledging source.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream
    }
}

// ─── Error Budget ───────────────────────────────────────────────────────────

/// Counts consecutive transient failures; any success resets the count.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    limit: u32,
    consecutive: u32,
    total: u64,
}

impl ErrorBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
            total: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns `true` once the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.total += 1;
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.consecutive >= self.limit
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

// ─── End of Stream ──────────────────────────────────────────────────────────

/// Decides when the stream is over: every active source sent FIN, or some
/// source did and nothing has arrived for the grace period since.
#[derive(Debug, Clone)]
pub struct FinTracker {
    expected: [bool; SOURCE_COUNT],
    seen: [bool; SOURCE_COUNT],
    first_at: Option<Instant>,
    quiet_since: Option<Instant>,
    grace: Duration,
}

impl FinTracker {
    pub fn new(expected: [bool; SOURCE_COUNT], grace: Duration) -> Self {
        Self {
            expected,
            seen: [false; SOURCE_COUNT],
            first_at: None,
            quiet_since: None,
            grace,
        }
    }

    pub fn on_fin(&mut self, src: u8, now: Instant) {
        if let Some(seen) = self.seen.get_mut(src as usize) {
            *seen = true;
            self.first_at.get_or_insert(now);
            self.quiet_since = Some(now);
        }
    }

    /// Any other traffic from the sources postpones the grace deadline.
    pub fn note_activity(&mut self, now: Instant) {
        self.quiet_since = Some(now);
    }

    pub fn any_seen(&self) -> bool {
        self.first_at.is_some()
    }

    /// Every expected source has sent FIN.
    pub fn all_received(&self) -> bool {
        self.any_seen()
            && self
                .expected
                .iter()
                .zip(&self.seen)
                .all(|(&expected, &seen)| !expected || seen)
    }

    /// Some source sent FIN and nothing arrived for the grace period since.
    pub fn grace_expired(&self, now: Instant) -> bool {
        match (self.first_at, self.quiet_since) {
            (Some(_), Some(since)) => now.duration_since(since) >= self.grace,
            _ => false,
        }
    }

    pub fn is_done(&self, now: Instant) -> bool {
        self.all_received() || self.grace_expired(now)
    }
}
