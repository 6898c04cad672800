//! # Splice Source Server
//!
//! One of the four sources of a splice session. Waits for a client request,
//! streams the sequence numbers the shared splice schedule assigns to this
//! source, answers retransmission requests, and exits when the session ends.
//!
//! ## Usage
//!
//! ```bash
//! # Source 2 on the default port, serving the files listed in the config
//! splice-server 2 --config splice.toml
//!
//! # Several sources on one host need distinct ports
//! splice-server 0 --bind 0.0.0.0:6000
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;

use clap::Parser;
use splice_bonding::config::SpliceConfig;
use splice_bonding::sender::server::SourceServer;
use splice_bonding::sender::source::Catalog;
use splice_transport::wire::SOURCE_COUNT;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let bind = args
        .bind
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.session.port)));

    tracing::info!(
        id = args.id,
        %bind,
        files = ?config.server.files,
        synthetic_packets = config.server.synthetic_packets,
        "splice-server starting"
    );

    // ── Server ──────────────────────────────────────────────────
    let catalog = Catalog::new(
        std::env::current_dir()?,
        config.server.files.clone(),
        config.server.synthetic_packets,
    );
    let mut server = SourceServer::bind(args.id, bind, config, catalog)?;

    // ── Graceful shutdown ───────────────────────────────────────
    {
        let cancel = server.cancel_token();
        ctrlc::set_handler(move || {
            tracing::info!("interrupted, shutting down...");
            cancel.store(true, Ordering::Relaxed);
        })?;
    }

    // ── Serve ───────────────────────────────────────────────────
    match server.serve() {
        Ok(report) => {
            tracing::info!(
                id = report.id,
                filename = %report.filename,
                outcome = ?report.outcome,
                sent = report.packets_sent,
                retransmits = report.retransmits,
                switches_accepted = report.switches_accepted,
                switches_rejected = report.switches_rejected,
                rate_kbps = report.rate_kbps,
                "splice-server stopped"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "session failed");
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<SpliceConfig> {
    let Some(path) = path else {
        return Ok(SpliceConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read config '{path}': {e}"))?;
    SpliceConfig::from_toml_str(&text).map_err(|e| anyhow::anyhow!("{path}: {e}"))
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// One source of a four-way splice stream. Catalog files are resolved
/// relative to the working directory.
#[derive(Parser, Debug)]
#[command(name = "splice-server", version, about)]
struct Args {
    /// Source id, 0-3.
    #[arg(value_parser = clap::value_parser!(u8).range(0..SOURCE_COUNT as i64))]
    id: u8,

    /// TOML configuration file.
    #[arg(short, long, env = "SPLICE_CONFIG")]
    config: Option<String>,

    /// UDP bind address (default: 0.0.0.0:<session.port>).
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}
