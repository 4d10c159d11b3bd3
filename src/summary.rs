//! End-of-run summary and its pretty/JSON renderings.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::NumberedOutput;
use crate::engine::CounterSnapshot;
use crate::net::pool::PoolStats;
use crate::AcceptedProbe;

/// Number of top lines echoed in the summary.
pub const PREVIEW_LINES: usize = 10;

/// Per-country tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountrySummary {
    pub country: String,
    pub emoji: String,
    pub count: usize,
    /// Whether the group reached the per-country limit (and so was written).
    pub meets_limit: bool,
}

/// Everything reported at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Candidates scheduled.
    pub total: usize,
    pub accepted: usize,
    /// Completed exchanges that classified as rejected.
    pub rejected: u64,
    /// Candidates that failed before classification.
    pub errors: u64,
    /// Accepted as a percentage of total.
    pub success_rate: f64,
    pub elapsed_secs: f64,
    /// Candidates processed per second.
    pub throughput: f64,
    pub counters: CounterSnapshot,
    pub pool: PoolStats,
    pub pool_hit_rate: f64,
    pub min_group_size: usize,
    pub countries: Vec<CountrySummary>,
    pub all_lines: usize,
    pub top_lines: usize,
    /// Leading lines of the top view.
    pub preview: Vec<String>,
}

impl RunSummary {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        total: usize,
        elapsed: Duration,
        counters: CounterSnapshot,
        pool: PoolStats,
        groups: &BTreeMap<String, Vec<AcceptedProbe>>,
        min_group_size: usize,
        output: &NumberedOutput,
    ) -> Self {
        let accepted: usize = groups.values().map(Vec::len).sum();
        let elapsed_secs = elapsed.as_secs_f64();
        let success_rate = percent(accepted, total);
        let throughput = if elapsed_secs > 0.0 {
            total as f64 / elapsed_secs
        } else {
            0.0
        };
        let countries = groups
            .iter()
            .map(|(country, members)| CountrySummary {
                country: country.clone(),
                emoji: members.first().map(|p| p.emoji.clone()).unwrap_or_default(),
                count: members.len(),
                meets_limit: members.len() >= min_group_size,
            })
            .collect();

        Self {
            run_id,
            started_at,
            total,
            accepted,
            rejected: counters.rejected,
            errors: counters.errors(),
            success_rate,
            elapsed_secs,
            throughput,
            counters,
            pool,
            pool_hit_rate: pool.hit_rate(),
            min_group_size,
            countries,
            all_lines: output.all.len(),
            top_lines: output.top.len(),
            preview: output.top.iter().take(PREVIEW_LINES).cloned().collect(),
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Human-readable summary.
pub fn format_pretty(summary: &RunSummary) -> String {
    let mut out = String::new();

    let version = env!("CARGO_PKG_VERSION");
    out.push_str(&format!("edgeprobe {version} run {}\n", summary.run_id));
    out.push_str(&format!(
        "{} endpoints probed in {:.2}s ({:.1}/s)\n",
        summary.total, summary.elapsed_secs, summary.throughput
    ));
    out.push_str(&format!(
        "accepted {} ({:.2}%), rejected {}, errors {}\n",
        summary.accepted, summary.success_rate, summary.rejected, summary.errors
    ));

    let c = &summary.counters;
    let mut error_parts = Vec::new();
    for (label, n) in [
        ("connect", c.connect_errors),
        ("handshake", c.handshake_errors),
        ("acquire timeout", c.acquire_timeouts),
        ("protocol", c.protocol_errors),
        ("response timeout", c.response_timeouts),
    ] {
        if n > 0 {
            error_parts.push(format!("{n} {label}"));
        }
    }
    if !error_parts.is_empty() {
        out.push_str(&format!("  errors: {}\n", error_parts.join(", ")));
    }

    let p = &summary.pool;
    out.push_str(&format!(
        "pool: hit rate {:.1}% ({} hits, {} misses), {} created, {} closed, {} TLS upgrades, {} open\n",
        summary.pool_hit_rate, p.hits, p.misses, p.created, p.closed, p.tls_upgrades, p.size
    ));
    out.push('\n');

    if summary.countries.is_empty() {
        out.push_str("no endpoints accepted\n");
        return out;
    }

    out.push_str(&format!("{:<10}{:<8}{}\n", "COUNTRY", "COUNT", "WRITTEN"));
    for country in &summary.countries {
        let label = format!("{}{}", country.emoji, country.country);
        let written = if country.meets_limit { "yes" } else { "no" };
        out.push_str(&format!("{:<10}{:<8}{}\n", label, country.count, written));
    }
    out.push('\n');
    out.push_str(&format!(
        "{} lines (all), {} lines (top {} per country)\n",
        summary.all_lines, summary.top_lines, summary.min_group_size
    ));
    for (i, line) in summary.preview.iter().enumerate() {
        out.push_str(&format!("  {}. {line}\n", i + 1));
    }
    if summary.top_lines > summary.preview.len() {
        out.push_str(&format!("  ... {} total\n", summary.top_lines));
    }

    out
}

/// Summary as pretty-printed JSON.
pub fn format_json(summary: &RunSummary) -> String {
    serde_json::to_string_pretty(summary)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}
