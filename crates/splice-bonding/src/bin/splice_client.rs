//! # Splice Client
//!
//! Requests one file from four source servers at once and writes the
//! reassembled stream to disk. The sources split the stream between them;
//! the client keeps adjusting the split to match what each path delivers.
//!
//! ## Usage
//!
//! ```bash
//! # Synthetic test stream, output discarded
//! splice-client 10.0.0.1 10.0.0.2 10.0.0.3 10.0.0.4
//!
//! # Fetch a catalog file with an arrival log for plotting
//! splice-client 10.0.0.1 10.0.0.2 10.0.0.3:6000 10.0.0.4 pic.bmp \
//!   --output pic.bmp --arrival-log arrivals.txt
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::Ordering;

use clap::Parser;
use splice_bonding::config::SpliceConfig;
use splice_bonding::net::parse_server_addr;
use splice_bonding::receiver::session::ClientSession;
use splice_bonding::receiver::sink::{FileSink, FrameSink, NullSink};
use splice_transport::wire::{SOURCE_COUNT, TEST_FILENAME};

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

    let mut servers = Vec::with_capacity(SOURCE_COUNT);
    for raw in args.servers() {
        let addr = parse_server_addr(raw, config.session.port)
            .ok_or_else(|| anyhow::anyhow!("cannot resolve server address '{raw}'"))?;
        servers.push(addr);
    }
    let servers: [SocketAddr; SOURCE_COUNT] = servers
        .try_into()
        .map_err(|_| anyhow::anyhow!("exactly {SOURCE_COUNT} servers are required"))?;

    let local_port = config.session.port.wrapping_add(1);
    tracing::info!(
        ?servers,
        filename = args.filename(),
        local_port,
        output = ?args.output,
        "splice-client starting"
    );

    // ── Session ─────────────────────────────────────────────────
    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port));
    let mut session = ClientSession::bind(local, servers, config)?;
    if let Some(path) = &args.arrival_log {
        let log = File::create(path)
            .map_err(|e| anyhow::anyhow!("cannot create arrival log '{path}': {e}"))?;
        session = session.with_arrival_log(Box::new(BufWriter::new(log)));
    }

    // ── Graceful shutdown ───────────────────────────────────────
    {
        let cancel = session.cancel_token();
        ctrlc::set_handler(move || {
            tracing::info!("interrupted, closing session...");
            cancel.store(true, Ordering::Relaxed);
        })?;
    }

    // ── Output sink ─────────────────────────────────────────────
    let sink: Box<dyn FrameSink> = match output_path(&args) {
        Some(path) => Box::new(FileSink::create(&path)?),
        None => {
            tracing::info!("output: monitor mode (set --output to capture)");
            Box::new(NullSink::default())
        }
    };

    // ── Transfer ────────────────────────────────────────────────
    match session.run(args.filename(), sink) {
        Ok((report, _sink)) => {
            tracing::info!(
                received = report.packets_received,
                per_source = ?report.packets_per_source,
                flushed = report.buffer.flushed,
                duplicates = report.buffer.duplicates,
                stale = report.buffer.stale,
                dropped = report.buffer.out_of_window,
                splice_pushes = report.splice.pushes,
                splice_retries = report.splice.retries,
                naks = report.naks_sent,
                rate_changes = report.rate_changes,
                rate_kbps = report.final_rate_kbps,
                cancelled = report.cancelled,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "splice-client finished"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "session failed");
            std::process::exit(1);
        }
    }
}

/// `--output` if given; otherwise a catalog file is saved under its own
/// name and the synthetic stream is discarded.
fn output_path(args: &Args) -> Option<String> {
    if let Some(path) = &args.output {
        return Some(path.clone());
    }
    if args.filename() == TEST_FILENAME {
        return None;
    }
    Path::new(args.filename())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
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

/// Fetch a file from four splice source servers.
#[derive(Parser, Debug)]
#[command(name = "splice-client", version, about)]
struct Args {
    /// Four source servers as ip, host, ip:port or host:port (port defaults
    /// to session.port), optionally followed by the file to request
    /// (default: /dev/urandom, the synthetic test stream).
    #[arg(
        value_name = "SERVER",
        required = true,
        num_args = SOURCE_COUNT..=SOURCE_COUNT + 1
    )]
    targets: Vec<String>,

    /// TOML configuration file.
    #[arg(short, long, env = "SPLICE_CONFIG")]
    config: Option<String>,

    /// Where to write the stream (default: FILE's base name; the test
    /// stream is discarded).
    #[arg(short, long)]
    output: Option<String>,

    /// Write "<elapsed ms> <seq>" per received packet.
    #[arg(short, long)]
    arrival_log: Option<String>,
}

impl Args {
    fn servers(&self) -> &[String] {
        &self.targets[..SOURCE_COUNT]
    }

    fn filename(&self) -> &str {
        self.targets
            .get(SOURCE_COUNT)
            .map_or(TEST_FILENAME, String::as_str)
    }
}
