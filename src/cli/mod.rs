//! CLI entrypoint for edgeprobe.
//!
//! Loads the candidate list and location table, shuffles the candidates,
//! probes them through a shared connection pool, then writes the bucketed
//! results and returns the run summary.

pub mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::aggregate::{group_by_country, number_groups};
use crate::engine::{acquire_ceiling, BatchScheduler, ProbeConfig, Prober};
use crate::input::{
    ensure_locations, read_candidates, read_locations, InputError, DEFAULT_LOCATIONS_URL,
    LOCATIONS_DOWNLOAD_TIMEOUT,
};
use crate::net::pool::{ConnectionPool, PoolConfig};
use crate::net::socket::SocketError;
use crate::summary::RunSummary;
use crate::IpPolicy;

pub use crate::summary::{format_json, format_pretty};
pub use output::{write_outputs, OutputError};

// ─────────────────────────────────────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────────────────────────────────────

/// edgeprobe: find CDN edge endpoints that answer, bucketed by country.
#[derive(Parser, Debug, Clone)]
#[command(name = "edgeprobe", version, about)]
#[command(
    long_about = "Probes candidate ip:port endpoints with an HTTP/1.1 trace request over \
    reused TCP/TLS connections, classifies each by the outbound address and data-center \
    location it reports, and writes per-country numbered lists."
)]
pub struct Cli {
    /// Candidate CSV (header row with IP and port columns)
    #[arg(long, env = "EDGEPROBE_INPUT", default_value = "init.csv")]
    pub input: PathBuf,

    /// Location table JSON (array of {iata, country, emoji, region})
    #[arg(long, env = "EDGEPROBE_LOCATIONS", default_value = "locations.json")]
    pub locations: PathBuf,

    /// Where to download the location table from when the file is missing
    #[arg(long, env = "EDGEPROBE_LOCATIONS_URL", default_value = DEFAULT_LOCATIONS_URL)]
    pub locations_url: String,

    /// Output file for every qualifying endpoint
    #[arg(long, env = "EDGEPROBE_OUT_ALL", default_value = "ip_tq_unlimited.txt")]
    pub out_all: PathBuf,

    /// Output file for the first N endpoints per country
    #[arg(long, env = "EDGEPROBE_OUT_TOP", default_value = "ip_tq_limited.txt")]
    pub out_top: PathBuf,

    /// Concurrent probes
    #[arg(long, env = "EDGEPROBE_CONCURRENCY", default_value = "200")]
    pub concurrency: usize,

    /// TCP connect timeout in milliseconds
    #[arg(long, env = "EDGEPROBE_TCP_TIMEOUT", default_value = "2000")]
    pub tcp_timeout: u64,

    /// TLS handshake timeout in milliseconds
    #[arg(long, env = "EDGEPROBE_TLS_TIMEOUT", default_value = "2000")]
    pub tls_timeout: u64,

    /// Request/response timeout in milliseconds
    #[arg(long, env = "EDGEPROBE_RESPONSE_TIMEOUT", default_value = "3000")]
    pub response_timeout: u64,

    /// Acquire ceiling in milliseconds (default: TCP timeout + 500)
    #[arg(long, env = "EDGEPROBE_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: Option<u64>,

    /// Close pooled connections idle for this many seconds
    #[arg(long, env = "EDGEPROBE_IDLE_TIMEOUT", default_value = "30")]
    pub idle_timeout: u64,

    /// Maximum pooled connections
    #[arg(long, env = "EDGEPROBE_POOL_CAPACITY", default_value = "500")]
    pub pool_capacity: usize,

    /// Seconds between background pool sweeps
    #[arg(long, env = "EDGEPROBE_SWEEP_INTERVAL", default_value = "10")]
    pub sweep_interval: u64,

    /// Endpoints per country in the top file; smaller groups are dropped
    #[arg(long, env = "EDGEPROBE_LIMIT", default_value = "5")]
    pub limit: usize,

    /// Accepted outbound address family
    #[arg(long, env = "EDGEPROBE_IP_POLICY", default_value = "v4-only", value_enum)]
    pub ip_policy: IpPolicyArg,

    /// Probe over plain TCP instead of TLS
    #[arg(long, env = "EDGEPROBE_NO_TLS")]
    pub no_tls: bool,

    /// Virtual host (also the TLS SNI)
    #[arg(long, env = "EDGEPROBE_HOST", default_value = "speed.cloudflare.com")]
    pub host: String,

    /// Trace path
    #[arg(long, env = "EDGEPROBE_PATH", default_value = "/cdn-cgi/trace")]
    pub path: String,

    /// Log progress every N completed endpoints
    #[arg(long, env = "EDGEPROBE_PROGRESS_EVERY", default_value = "10")]
    pub progress_every: usize,

    /// Summary format
    #[arg(long, default_value = "pretty", value_enum)]
    pub output: OutputFmt,
}

/// Outbound address family argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPolicyArg {
    Any,
    #[value(name = "v4-only")]
    V4Only,
    #[value(name = "v6-only")]
    V6Only,
}

impl From<IpPolicyArg> for IpPolicy {
    fn from(p: IpPolicyArg) -> Self {
        match p {
            IpPolicyArg::Any => IpPolicy::Any,
            IpPolicyArg::V4Only => IpPolicy::V4Only,
            IpPolicyArg::V6Only => IpPolicy::V6Only,
        }
    }
}

/// Output format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFmt {
    Pretty,
    Json,
}

impl Cli {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool_capacity,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            connect_timeout: Duration::from_millis(self.tcp_timeout),
            tls_timeout: Duration::from_millis(self.tls_timeout),
            server_name: self.host.clone(),
            sweep_interval: Duration::from_secs(self.sweep_interval),
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        let tcp = Duration::from_millis(self.tcp_timeout);
        ProbeConfig {
            host: self.host.clone(),
            path: self.path.clone(),
            use_tls: !self.no_tls,
            policy: self.ip_policy.into(),
            response_timeout: Duration::from_millis(self.response_timeout),
            acquire_timeout: self
                .acquire_timeout
                .map(Duration::from_millis)
                .unwrap_or_else(|| acquire_ceiling(tcp)),
            ..ProbeConfig::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

/// Fatal error for a whole run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("pool setup failed: {0}")]
    Pool(#[from] SocketError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Run the whole flow: load → shuffle → probe → aggregate → write.
pub async fn run(cli: &Cli) -> Result<RunSummary, RunError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let mut candidates = read_candidates(&cli.input)?;
    ensure_locations(&cli.locations, &cli.locations_url, LOCATIONS_DOWNLOAD_TIMEOUT).await?;
    let locations = Arc::new(read_locations(&cli.locations)?);
    candidates.shuffle(&mut rand::thread_rng());
    let total = candidates.len();

    let pool = Arc::new(ConnectionPool::new(cli.pool_config())?);
    pool.spawn_sweeper();
    let prober = Arc::new(Prober::new(pool.clone(), locations, cli.probe_config()));

    tracing::info!(
        run_id = %run_id,
        total,
        concurrency = cli.concurrency,
        tls = !cli.no_tls,
        policy = %IpPolicy::from(cli.ip_policy),
        "starting probe run"
    );

    let scheduler = BatchScheduler::new(cli.concurrency)
        .with_progress_every(cli.progress_every)
        .with_pool(pool.clone());
    let worker = prober.clone();
    let report = scheduler
        .run(candidates, move |endpoint| {
            let prober = worker.clone();
            async move { prober.check(endpoint).await }
        })
        .await;
    if report.failed > 0 {
        tracing::warn!(failed = report.failed, "some probes panicked");
    }

    let pool_stats = pool.shutdown();
    let counters = prober.counters();
    let elapsed = report.elapsed;

    let groups = group_by_country(report.results);
    let numbered = number_groups(&groups, cli.limit);
    write_outputs(&numbered, &cli.out_all, &cli.out_top)?;

    Ok(RunSummary::new(
        run_id,
        started_at,
        total,
        elapsed,
        counters,
        pool_stats,
        &groups,
        cli.limit,
        &numbered,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
