//! Probing engine: the per-endpoint pipeline and the batch scheduler that
//! drives it with bounded concurrency.
//!
//! [`Prober`] owns nothing but shared handles (pool, location table) and a
//! set of counters; every per-endpoint failure stops here and becomes a
//! counter increment. [`BatchScheduler`] is generic over the pipeline so it
//! can be exercised without a network.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::classify::{classify, LocationTable};
use crate::net::pool::ConnectionPool;
use crate::net::socket::SocketError;
use crate::probe::http::{probe, ProbeError};
use crate::probe::trace::extract_fields;
use crate::{AcceptedProbe, Endpoint, IpPolicy, ProbeResult};

/// Default number of concurrent probes.
pub const DEFAULT_CONCURRENCY: usize = 200;

/// Default interval (in completed items) between progress lines.
pub const DEFAULT_PROGRESS_EVERY: usize = 10;

/// Slack added to the TCP connect timeout to form the acquire ceiling.
pub const ACQUIRE_SLACK: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Virtual host sent in `Host:`.
    pub host: String,
    /// Request path.
    pub path: String,
    /// Probe over TLS (upgrading pooled plain connections as needed).
    pub use_tls: bool,
    /// Accepted outbound address families.
    pub policy: IpPolicy,
    /// Bounds the request write plus the full response read.
    pub response_timeout: Duration,
    /// Ceiling on the whole acquire (connect + handshake, or waiting for a
    /// leased connection).
    pub acquire_timeout: Duration,
    /// Timeouts taking longer than this are logged at warn.
    pub slow_log_threshold: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: "speed.cloudflare.com".to_string(),
            path: "/cdn-cgi/trace".to_string(),
            use_tls: true,
            policy: IpPolicy::V4Only,
            response_timeout: Duration::from_millis(3000),
            acquire_timeout: acquire_ceiling(Duration::from_millis(2000)),
            slow_log_threshold: Duration::from_millis(5000),
        }
    }
}

/// Acquire ceiling derived from the TCP connect timeout.
pub fn acquire_ceiling(connect_timeout: Duration) -> Duration {
    connect_timeout + ACQUIRE_SLACK
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors and counters
// ─────────────────────────────────────────────────────────────────────────────

/// Why one endpoint's pipeline produced no result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("acquire failed: {0}")]
    Acquire(#[from] SocketError),

    #[error("acquire exceeded {timeout_ms}ms ceiling")]
    AcquireTimeout { timeout_ms: u64 },

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),
}

impl PipelineError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Acquire(e) => e.is_timeout(),
            Self::AcquireTimeout { .. } => true,
            Self::Probe(e) => e.is_timeout(),
        }
    }
}

/// Outcome tallies for a [`Prober`].
#[derive(Debug, Default)]
pub struct ProbeCounters {
    connect_errors: AtomicU64,
    handshake_errors: AtomicU64,
    acquire_timeouts: AtomicU64,
    protocol_errors: AtomicU64,
    response_timeouts: AtomicU64,
    rejected: AtomicU64,
    accepted: AtomicU64,
}

/// Snapshot of [`ProbeCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub connect_errors: u64,
    pub handshake_errors: u64,
    pub acquire_timeouts: u64,
    pub protocol_errors: u64,
    pub response_timeouts: u64,
    pub rejected: u64,
    pub accepted: u64,
}

impl CounterSnapshot {
    /// Endpoints that failed before classification.
    pub fn errors(&self) -> u64 {
        self.connect_errors
            + self.handshake_errors
            + self.acquire_timeouts
            + self.protocol_errors
            + self.response_timeouts
    }
}

impl ProbeCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            response_timeouts: self.response_timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
        }
    }

    fn record_error(&self, err: &PipelineError) {
        let counter = match err {
            PipelineError::Acquire(e) if e.is_handshake() => &self.handshake_errors,
            PipelineError::Acquire(_) => &self.connect_errors,
            PipelineError::AcquireTimeout { .. } => &self.acquire_timeouts,
            PipelineError::Probe(ProbeError::ResponseTimeout { .. }) => &self.response_timeouts,
            PipelineError::Probe(_) => &self.protocol_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prober
// ─────────────────────────────────────────────────────────────────────────────

/// Per-endpoint pipeline: acquire → probe → extract → classify → release.
#[derive(Debug)]
pub struct Prober {
    pool: Arc<ConnectionPool>,
    locations: Arc<LocationTable>,
    config: ProbeConfig,
    counters: ProbeCounters,
}

impl Prober {
    pub fn new(pool: Arc<ConnectionPool>, locations: Arc<LocationTable>, config: ProbeConfig) -> Self {
        Self {
            pool,
            locations,
            config,
            counters: ProbeCounters::default(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Run the pipeline for one endpoint and surface every failure.
    ///
    /// The connection goes back to the pool after a complete exchange, even
    /// if the result is rejected; after any probe error it is evicted.
    pub async fn probe_endpoint(&self, endpoint: Endpoint) -> Result<ProbeResult, PipelineError> {
        let ceiling = self.config.acquire_timeout;
        let acquire = self.pool.acquire(&endpoint, self.config.use_tls);
        let mut lease = match tokio::time::timeout(ceiling, acquire).await {
            Ok(lease) => lease?,
            Err(_) => {
                return Err(PipelineError::AcquireTimeout {
                    timeout_ms: ceiling.as_millis() as u64,
                })
            }
        };

        let exchange = match lease.stream() {
            Some(stream) => {
                probe(
                    stream,
                    &self.config.host,
                    &self.config.path,
                    self.config.response_timeout,
                )
                .await
            }
            None => Err(ProbeError::ConnectionClosed),
        };

        match exchange {
            Ok(body) => {
                self.pool.release(lease);
                let fields = extract_fields(&body);
                Ok(classify(&fields, &self.locations, self.config.policy, endpoint))
            }
            Err(e) => {
                self.pool.evict(lease);
                Err(e.into())
            }
        }
    }

    /// Run the pipeline and fold the outcome into the counters. Returns the
    /// accepted probe, if any.
    pub async fn check(&self, endpoint: Endpoint) -> Option<AcceptedProbe> {
        let started = Instant::now();
        match self.probe_endpoint(endpoint).await {
            Ok(ProbeResult::Accepted(accepted)) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    endpoint = %endpoint,
                    colo = %accepted.location_code,
                    outbound = %accepted.outbound_ip,
                    "accepted"
                );
                Some(accepted)
            }
            Ok(ProbeResult::Rejected(reason)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(endpoint = %endpoint, reason = %reason, "rejected");
                None
            }
            Err(e) => {
                self.counters.record_error(&e);
                let elapsed = started.elapsed();
                if e.is_timeout() && elapsed > self.config.slow_log_threshold {
                    tracing::warn!(
                        endpoint = %endpoint,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %e,
                        "slow timeout"
                    );
                } else {
                    tracing::debug!(endpoint = %endpoint, error = %e, "probe failed");
                }
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a batch run.
#[derive(Debug, Clone)]
pub struct BatchReport<R> {
    /// Results in completion order.
    pub results: Vec<R>,
    /// Items whose pipeline ran to completion or panicked.
    pub processed: usize,
    /// Items whose pipeline panicked.
    pub failed: usize,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl<R> BatchReport<R> {
    pub fn accepted(&self) -> usize {
        self.results.len()
    }
}

/// Runs a pipeline over a list with a fixed number of workers.
///
/// Workers share an atomic cursor, so each index is claimed exactly once and
/// no more than `min(concurrency, len)` pipelines run at a time.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    concurrency: usize,
    progress_every: usize,
    pool: Option<Arc<ConnectionPool>>,
}

impl BatchScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            progress_every: DEFAULT_PROGRESS_EVERY,
            pool: None,
        }
    }

    /// Log progress every `n` completions (0 disables periodic lines).
    pub fn with_progress_every(mut self, n: usize) -> Self {
        self.progress_every = n;
        self
    }

    /// Include this pool's hit rate in progress lines.
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Process every item once. A pipeline returning `Some` contributes a
    /// result; a panicking pipeline is logged and counted in `failed`.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, pipeline: F) -> BatchReport<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<R>> + Send + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let items = Arc::new(items);
        let pipeline = Arc::new(pipeline);
        let shared = Arc::new(BatchState {
            cursor: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            results: parking_lot::Mutex::new(Vec::new()),
        });

        let workers = self.concurrency.min(total);
        tracing::info!(total, workers, "batch started");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..workers {
            let items = items.clone();
            let pipeline = pipeline.clone();
            let shared = shared.clone();
            let progress = self.clone();
            tasks.spawn(async move {
                loop {
                    let idx = shared.cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(item) = items.get(idx).cloned() else {
                        break;
                    };
                    match tokio::spawn(pipeline(item)).await {
                        Ok(Some(result)) => shared.results.lock().push(result),
                        Ok(None) => {}
                        Err(e) => {
                            shared.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(index = idx, error = %e, "pipeline task failed");
                        }
                    }
                    let done = shared.completed.fetch_add(1, Ordering::Relaxed) + 1;
                    progress.report(done, total, shared.results.lock().len());
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "batch worker failed");
            }
        }

        let results = std::mem::take(&mut *shared.results.lock());
        BatchReport {
            results,
            processed: shared.completed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        }
    }

    fn report(&self, done: usize, total: usize, accepted: usize) {
        let periodic = self.progress_every > 0 && done % self.progress_every == 0;
        if !periodic && done != total {
            return;
        }
        let percent = if total == 0 { 100.0 } else { done as f64 / total as f64 * 100.0 };
        match &self.pool {
            Some(pool) => {
                let stats = pool.stats();
                tracing::info!(
                    done,
                    total,
                    accepted,
                    pool_size = stats.size,
                    "progress {percent:.1}% | pool hit rate {:.1}%",
                    stats.hit_rate()
                );
            }
            None => tracing::info!(done, total, accepted, "progress {percent:.1}%"),
        }
    }
}

struct BatchState<R> {
    cursor: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    results: parking_lot::Mutex<Vec<R>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
