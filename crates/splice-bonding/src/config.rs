use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use splice_transport::arq::SelectionStrategy;
use splice_transport::congestion::RateControlConfig;

pub const CONFIG_VERSION: u32 = 1;

/// Default UDP port of a source server. The client binds `port + 1`.
pub const DEFAULT_PORT: u16 = 55555;

// ─── Raw TOML input ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpliceConfigInput {
    pub version: u32,
    pub splice: SpliceTuningInput,
    pub buffer: BufferConfigInput,
    pub rate: RateConfigInput,
    pub retransmit: RetransmitConfigInput,
    pub session: SessionConfigInput,
    pub server: ServerConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpliceTuningInput {
    pub delay_ms: Option<u64>,
    pub frame: Option<u32>,
    pub threshold: Option<u32>,
    pub gap: Option<u32>,
    pub ignore_divisor: Option<u32>,
    pub ack_timeout_divisor: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BufferConfigInput {
    pub capacity: Option<usize>,
    pub lost_threshold: Option<u32>,
    pub check_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateConfigInput {
    pub max_kbps: Option<u32>,
    pub floor_kbps: Option<u32>,
    pub high_water: Option<f64>,
    pub low_water: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetransmitConfigInput {
    pub strategy: Option<SelectionStrategy>,
    pub seed: Option<u64>,
    pub max_per_tick: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub port: Option<u16>,
    pub recv_timeout_ms: Option<u64>,
    pub max_consecutive_errors: Option<u32>,
    pub fin_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfigInput {
    pub synthetic_packets: Option<u32>,
    pub files: Option<Vec<String>>,
}

// ─── Resolved configuration ─────────────────────────────────────────────────

/// Splice ratio measurement and switchover tuning.
#[derive(Debug, Clone)]
pub struct SpliceTuning {
    /// Measurement window.
    pub delay: Duration,
    /// Frame size `F`: every ratio vector sums to this.
    pub frame: u8,
    /// Minimum total weight movement that triggers a push.
    pub threshold: u32,
    /// Safety gap between the newest observed sequence and the switchover.
    pub gap: u32,
    /// A source is starved when its weight is at or below `frame / ignore_divisor`.
    pub ignore_divisor: u8,
    pub ack_timeout_divisor: u32,
}

impl SpliceTuning {
    pub fn ack_timeout(&self) -> Duration {
        self.delay / self.ack_timeout_divisor.max(1)
    }
}

impl Default for SpliceTuning {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            frame: 100,
            threshold: 15,
            gap: 200,
            ignore_divisor: 20,
            ack_timeout_divisor: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub capacity: usize,
    /// Holes this far behind the newest sequence are reported lost.
    pub lost_threshold: u32,
    /// Period of the flush / rate / retransmit timer.
    pub check_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            lost_threshold: 500,
            check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    pub strategy: SelectionStrategy,
    pub seed: u64,
    pub max_per_tick: usize,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::RoundRobin,
            seed: 0,
            max_per_tick: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: u16,
    pub recv_timeout: Duration,
    pub max_consecutive_errors: u32,
    /// How long the client waits for the remaining FINs after the first one.
    pub fin_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            recv_timeout: Duration::from_secs(2),
            max_consecutive_errors: 5,
            fin_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Length of the synthetic test stream in data packets.
    pub synthetic_packets: u32,
    /// Files this server is willing to stream.
    pub files: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            synthetic_packets: 30_000,
            files: vec!["pic.bmp".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpliceConfig {
    pub version: u32,
    pub splice: SpliceTuning,
    pub buffer: BufferConfig,
    pub rate: RateControlConfig,
    pub retransmit: RetransmitConfig,
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            splice: SpliceTuning::default(),
            buffer: BufferConfig::default(),
            rate: RateControlConfig::default(),
            retransmit: RetransmitConfig::default(),
            session: SessionConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl SpliceConfigInput {
    pub fn resolve(self) -> Result<SpliceConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let splice = self.splice.resolve()?;
        let buffer = self.buffer.resolve()?;
        let rate = self.rate.resolve()?;

        let retransmit_defaults = RetransmitConfig::default();
        let retransmit = RetransmitConfig {
            strategy: self
                .retransmit
                .strategy
                .unwrap_or(retransmit_defaults.strategy),
            seed: self.retransmit.seed.unwrap_or(retransmit_defaults.seed),
            max_per_tick: self
                .retransmit
                .max_per_tick
                .unwrap_or(retransmit_defaults.max_per_tick)
                .max(1),
        };

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            port: self.session.port.unwrap_or(session_defaults.port),
            recv_timeout: self
                .session
                .recv_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(session_defaults.recv_timeout),
            max_consecutive_errors: self
                .session
                .max_consecutive_errors
                .unwrap_or(session_defaults.max_consecutive_errors)
                .max(1),
            fin_grace: self
                .session
                .fin_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(session_defaults.fin_grace),
        };
        if session.recv_timeout.is_zero() {
            return Err("session.recv_timeout_ms must be positive".to_string());
        }

        let server_defaults = ServerConfig::default();
        let files = match self.server.files {
            Some(list) => {
                let mut seen = HashSet::new();
                list.into_iter()
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty() && seen.insert(f.clone()))
                    .collect()
            }
            None => server_defaults.files,
        };
        let server = ServerConfig {
            synthetic_packets: self
                .server
                .synthetic_packets
                .unwrap_or(server_defaults.synthetic_packets),
            files,
        };

        Ok(SpliceConfig {
            version,
            splice,
            buffer,
            rate,
            retransmit,
            session,
            server,
        })
    }
}

impl SpliceTuningInput {
    fn resolve(self) -> Result<SpliceTuning, String> {
        let d = SpliceTuning::default();
        let frame = self.frame.unwrap_or(u32::from(d.frame));
        if frame == 0 || frame > u32::from(u8::MAX) {
            return Err(format!("splice.frame must be in 1..=255, got {}", frame));
        }
        let ignore_divisor = self.ignore_divisor.unwrap_or(u32::from(d.ignore_divisor));
        if ignore_divisor == 0 || ignore_divisor > u32::from(u8::MAX) {
            return Err(format!(
                "splice.ignore_divisor must be in 1..=255, got {}",
                ignore_divisor
            ));
        }
        let delay = self.delay_ms.map(Duration::from_millis).unwrap_or(d.delay);
        if delay.is_zero() {
            return Err("splice.delay_ms must be positive".to_string());
        }
        Ok(SpliceTuning {
            delay,
            frame: frame as u8,
            threshold: self.threshold.unwrap_or(d.threshold),
            gap: self.gap.unwrap_or(d.gap).max(1),
            ignore_divisor: ignore_divisor as u8,
            ack_timeout_divisor: self
                .ack_timeout_divisor
                .unwrap_or(d.ack_timeout_divisor)
                .max(1),
        })
    }
}

impl BufferConfigInput {
    fn resolve(self) -> Result<BufferConfig, String> {
        let d = BufferConfig::default();
        let capacity = self.capacity.unwrap_or(d.capacity).max(8);
        let lost_threshold = self.lost_threshold.unwrap_or(d.lost_threshold);
        if lost_threshold as usize >= capacity {
            return Err(format!(
                "buffer.lost_threshold ({}) must be below buffer.capacity ({})",
                lost_threshold, capacity
            ));
        }
        let check_interval = self
            .check_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(d.check_interval);
        if check_interval.is_zero() {
            return Err("buffer.check_interval_ms must be positive".to_string());
        }
        Ok(BufferConfig {
            capacity,
            lost_threshold,
            check_interval,
        })
    }
}

impl RateConfigInput {
    fn resolve(self) -> Result<RateControlConfig, String> {
        let d = RateControlConfig::default();
        let cfg = RateControlConfig {
            max_kbps: self.max_kbps.unwrap_or(d.max_kbps),
            floor_kbps: self.floor_kbps.unwrap_or(d.floor_kbps).max(1),
            high_water: self.high_water.unwrap_or(d.high_water),
            low_water: self.low_water.unwrap_or(d.low_water),
        };
        if cfg.max_kbps < cfg.floor_kbps {
            return Err(format!(
                "rate.max_kbps ({}) is below rate.floor_kbps ({})",
                cfg.max_kbps, cfg.floor_kbps
            ));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(cfg.high_water) || !in_unit(cfg.low_water) || cfg.low_water >= cfg.high_water
        {
            return Err(format!(
                "rate water marks must satisfy 0 <= low ({}) < high ({}) <= 1",
                cfg.low_water, cfg.high_water
            ));
        }
        Ok(cfg)
    }
}

impl SpliceConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(SpliceConfig::default());
        }
        let parsed: SpliceConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = SpliceConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.splice.frame, 100);
        assert_eq!(cfg.splice.ack_timeout(), Duration::from_micros(62_500));
        assert_eq!(cfg.buffer.capacity, 1000);
        assert_eq!(cfg.rate.max_kbps, 30);
        assert_eq!(cfg.session.port, DEFAULT_PORT);
        assert_eq!(cfg.server.files, vec!["pic.bmp".to_string()]);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [splice]
            delay_ms = 250
            frame = 40
            threshold = 4

            [buffer]
            capacity = 64
            lost_threshold = 16
            check_interval_ms = 20

            [rate]
            max_kbps = 1000
            high_water = 0.8
            low_water = 0.1

            [retransmit]
            strategy = "random"
            seed = 9

            [session]
            port = 6000
            fin_grace_ms = 300

            [server]
            synthetic_packets = 200
            files = ["a.bin", " b.bin ", "a.bin", ""]
        "#;

        let cfg = SpliceConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.splice.delay, Duration::from_millis(250));
        assert_eq!(cfg.splice.frame, 40);
        assert_eq!(cfg.splice.threshold, 4);
        assert_eq!(cfg.splice.gap, 200);
        assert_eq!(cfg.buffer.capacity, 64);
        assert_eq!(cfg.buffer.check_interval, Duration::from_millis(20));
        assert_eq!(cfg.rate.max_kbps, 1000);
        assert_eq!(cfg.retransmit.strategy, SelectionStrategy::Random);
        assert_eq!(cfg.retransmit.seed, 9);
        assert_eq!(cfg.session.port, 6000);
        assert_eq!(cfg.session.fin_grace, Duration::from_millis(300));
        assert_eq!(cfg.server.synthetic_packets, 200);
        assert_eq!(cfg.server.files, vec!["a.bin".to_string(), "b.bin".to_string()]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(SpliceConfig::from_toml_str("version = 2").is_err());
        assert!(SpliceConfig::from_toml_str("[splice]\nframe = 300").is_err());
        assert!(SpliceConfig::from_toml_str("[splice]\nframe = 0").is_err());
        assert!(SpliceConfig::from_toml_str("[buffer]\ncapacity = 100\nlost_threshold = 100").is_err());
        assert!(SpliceConfig::from_toml_str("[rate]\nhigh_water = 0.2\nlow_water = 0.3").is_err());
        assert!(SpliceConfig::from_toml_str("[rate]\nmax_kbps = 0").is_err());
        assert!(SpliceConfig::from_toml_str("[retransmit]\nstrategy = \"fastest\"").is_err());
        assert!(SpliceConfig::from_toml_str("not toml at all [").is_err());
    }

    #[test]
    fn buffer_capacity_has_a_floor() {
        let cfg = SpliceConfig::from_toml_str("[buffer]\ncapacity = 2\nlost_threshold = 4").unwrap();
        assert_eq!(cfg.buffer.capacity, 8);
    }
}
