//! Probe protocol: one raw HTTP/1.1 exchange over a pooled stream, and the
//! `key=value` trace document it returns.

pub mod http;
pub mod trace;

pub use http::{build_request, probe, ProbeError, ResponseParser};
pub use trace::{extract_fields, TraceFields};
