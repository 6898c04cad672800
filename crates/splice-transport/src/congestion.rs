//! # Occupancy-driven rate control
//!
//! The client watches how full its reorder buffer is and asks all four
//! sources for a new per-source transmit rate:
//!
//! ```text
//!   occupancy > high_water  && rate > floor      ──▶ rate / 2
//!   occupancy < low_water   && rate * 2 <= max   ──▶ rate * 2
//! ```
//!
//! Rate changes are fire-and-forget. Each source converts the requested rate
//! into an inter-packet delay with [`pacing_delay`].

use std::time::Duration;
use tracing::debug;

use crate::wire::DATA_PACKET_LEN;

/// Rate controller thresholds.
#[derive(Debug, Clone)]
pub struct RateControlConfig {
    /// Upper bound and starting rate, kB/s per source.
    pub max_kbps: u32,
    /// The rate is only halved while strictly above this.
    pub floor_kbps: u32,
    /// Occupancy above which the rate is halved.
    pub high_water: f64,
    /// Occupancy below which the rate is doubled.
    pub low_water: f64,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            max_kbps: 30,
            floor_kbps: 1,
            high_water: 0.5,
            low_water: 0.3,
        }
    }
}

/// Direction of a rate decision, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateChange {
    Decrease(u32),
    Increase(u32),
}

impl RateChange {
    pub fn rate_kbps(self) -> u32 {
        match self {
            RateChange::Decrease(r) | RateChange::Increase(r) => r,
        }
    }
}

/// Halving/doubling controller driven by buffer occupancy.
#[derive(Debug)]
pub struct RateController {
    config: RateControlConfig,
    rate_kbps: u32,
    changes: u64,
}

impl RateController {
    pub fn new(config: RateControlConfig) -> Self {
        Self::with_rate(config.max_kbps, config)
    }

    /// Start from an explicit rate instead of the maximum.
    pub fn with_rate(rate_kbps: u32, config: RateControlConfig) -> Self {
        Self {
            rate_kbps: rate_kbps.min(config.max_kbps),
            config,
            changes: 0,
        }
    }

    /// Currently requested rate in kB/s.
    pub fn rate_kbps(&self) -> u32 {
        self.rate_kbps
    }

    /// Number of changes issued so far.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Feed one occupancy sample. Returns the new rate when it changed; the
    /// caller broadcasts it to every source.
    pub fn on_occupancy(&mut self, occupancy: f64) -> Option<RateChange> {
        let change = if occupancy > self.config.high_water
            && self.rate_kbps > self.config.floor_kbps
        {
            self.rate_kbps /= 2;
            RateChange::Decrease(self.rate_kbps)
        } else if occupancy < self.config.low_water
            && self.rate_kbps.saturating_mul(2) <= self.config.max_kbps
            && self.rate_kbps > 0
        {
            self.rate_kbps *= 2;
            RateChange::Increase(self.rate_kbps)
        } else {
            return None;
        };
        self.changes += 1;
        debug!(occupancy, rate_kbps = self.rate_kbps, "rate change");
        Some(change)
    }
}

/// Delay between two data packets that keeps one source at `rate_kbps`
/// (1 kB = 1000 bytes). A zero rate is treated as 1 kB/s.
pub fn pacing_delay(rate_kbps: u32) -> Duration {
    let bytes_per_sec = u64::from(rate_kbps.max(1)) * 1000;
    Duration::from_micros(DATA_PACKET_LEN as u64 * 1_000_000 / bytes_per_sec)
}
