//! Turn a parsed trace into an accepted probe or a rejection reason.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use chrono::Utc;
use serde::Serialize;

use crate::probe::trace::TraceFields;
use crate::{AcceptedProbe, Endpoint, IpPolicy, IpVersion, LocationRecord, ProbeResult};

/// Location code → record lookup.
#[derive(Debug, Clone, Default)]
pub struct LocationTable {
    entries: HashMap<String, LocationRecord>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (String, LocationRecord)>,
    {
        Self {
            entries: records.into_iter().collect(),
        }
    }

    /// Insert or replace the record for `code`.
    pub fn insert(&mut self, code: impl Into<String>, record: LocationRecord) {
        self.entries.insert(code.into(), record);
    }

    pub fn get(&self, code: &str) -> Option<&LocationRecord> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a completed exchange did not produce an accepted probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    /// Trace had no `ip` field.
    MissingOutboundIp,
    /// `ip` was not an address literal.
    InvalidOutboundIp(String),
    /// Outbound family excluded by the policy.
    FilteredFamily(IpVersion),
    /// `colo` missing or not in the location table.
    UnknownLocation(Option<String>),
}

impl RejectReason {
    /// Short label used in logs and counters.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingOutboundIp => "missing_outbound_ip",
            Self::InvalidOutboundIp(_) => "invalid_outbound_ip",
            Self::FilteredFamily(_) => "filtered_family",
            Self::UnknownLocation(_) => "unknown_location",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOutboundIp => write!(f, "trace has no outbound ip"),
            Self::InvalidOutboundIp(ip) => write!(f, "invalid outbound ip '{ip}'"),
            Self::FilteredFamily(v) => write!(f, "outbound family {v} filtered"),
            Self::UnknownLocation(Some(code)) => write!(f, "unknown location '{code}'"),
            Self::UnknownLocation(None) => write!(f, "trace has no location"),
        }
    }
}

/// Classify one trace for `endpoint`.
///
/// Checks run in order: outbound ip present, parseable, family allowed by
/// `policy`, then location known. The first failing check decides.
pub fn classify(
    fields: &TraceFields,
    table: &LocationTable,
    policy: IpPolicy,
    endpoint: Endpoint,
) -> ProbeResult {
    let Some(raw_ip) = fields.ip() else {
        return ProbeResult::Rejected(RejectReason::MissingOutboundIp);
    };
    let Ok(outbound_ip) = raw_ip.parse::<IpAddr>() else {
        return ProbeResult::Rejected(RejectReason::InvalidOutboundIp(raw_ip.to_string()));
    };

    let ip_version = IpVersion::of(&outbound_ip);
    if !policy.allows(ip_version) {
        return ProbeResult::Rejected(RejectReason::FilteredFamily(ip_version));
    }

    let code = fields.colo();
    let Some(record) = code.and_then(|c| table.get(c)) else {
        return ProbeResult::Rejected(RejectReason::UnknownLocation(code.map(str::to_string)));
    };

    ProbeResult::Accepted(AcceptedProbe {
        endpoint,
        outbound_ip,
        location_code: code.unwrap_or_default().to_string(),
        country: record.country.clone(),
        emoji: record.emoji.clone(),
        region: record.region.clone(),
        ip_version,
        observed_at: Utc::now(),
    })
}
