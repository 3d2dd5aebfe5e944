//! Speed test protocol types.
//!
//! The browser client drives every measurement with plain HTTP requests whose
//! intent is carried in the `X-SpeedTest` header. This module holds the
//! header vocabulary, the per-request classification derived from it, the
//! JSON body of the address lookup, and the size negotiation rules for
//! payload-returning operations.

use serde::{Deserialize, Serialize};

use crate::params;

/// Value of the `X-SpeedTest` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Round-trip latency probe.
    Ping,
    /// Download (server-to-client) chunk.
    Download,
    /// Upload (client-to-server) chunk.
    Upload,
    /// Pre-test bandwidth probe.
    Calibration,
}

impl TestKind {
    /// Parse a header value. Matching is exact and case-sensitive.
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "ping" => Some(TestKind::Ping),
            "download" => Some(TestKind::Download),
            "upload" => Some(TestKind::Upload),
            "calibration" => Some(TestKind::Calibration),
            _ => None,
        }
    }
}

/// What a single inbound request asks of the speed test endpoints.
///
/// Derived from method, path and headers by [`crate::classify::classify`];
/// never stored beyond the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClassification {
    /// The human-facing test page.
    Page,
    /// Latency probe.
    Ping,
    /// Download chunk.
    Download,
    /// Upload sink.
    Upload,
    /// Calibration payload.
    CalibrationDownload,
    /// Calibration upload sink.
    CalibrationUpload,
    /// Client address lookup.
    IpLookup,
    /// Not a speed test request; the host handles it.
    None,
}

impl RequestClassification {
    /// Whether the request belongs to the speed test at all.
    pub fn is_test(self) -> bool {
        self != RequestClassification::None
    }

    /// Calibration probes and the address lookup never pass the access gate.
    pub fn bypasses_gate(self) -> bool {
        matches!(
            self,
            RequestClassification::CalibrationDownload
                | RequestClassification::CalibrationUpload
                | RequestClassification::IpLookup
        )
    }
}

/// Address family reported by the lookup endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    /// IPv4 address.
    #[serde(rename = "IPv4")]
    V4,
    /// IPv6 address, including IPv4-mapped forms.
    #[serde(rename = "IPv6")]
    V6,
}

impl IpVersion {
    /// Any address text containing a colon is reported as IPv6.
    pub fn of(ip: &str) -> Self {
        if ip.contains(':') {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }
}

/// Body of the address lookup response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    /// Address the request is attributed to.
    pub ip: String,
    /// Forwarded chain, closest client first. Empty unless proxies are trusted.
    pub ips: Vec<String>,
    /// Family of [`ip`](Self::ip).
    #[serde(rename = "ipVersion")]
    pub ip_version: IpVersion,
}

impl IpInfo {
    /// Build the lookup body for `ip`.
    pub fn new(ip: String, ips: Vec<String>) -> Self {
        let ip_version = IpVersion::of(&ip);
        IpInfo {
            ip,
            ips,
            ip_version,
        }
    }
}

/// Parse a size hint header leniently.
///
/// Leading whitespace and an optional sign are accepted, then the leading run
/// of decimal digits is taken and anything after it ignored. Returns `None`
/// when no digits are present. Overlong values saturate.
pub fn parse_size_hint(value: &str) -> Option<i64> {
    let s = value.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude = digits[..end].bytes().fold(0i64, |acc, b| {
        acc.saturating_mul(10).saturating_add(i64::from(b - b'0'))
    });
    Some(if negative { -magnitude } else { magnitude })
}

/// Download chunk size for an optional `X-Chunk-Size` value.
///
/// Requests inside `[MIN_CHUNK_SIZE, capacity]` are honoured exactly; anything
/// else falls back to [`params::DEFAULT_CHUNK_SIZE`].
pub fn negotiate_chunk_size(requested: Option<&str>, capacity: usize) -> usize {
    let default = params::DEFAULT_CHUNK_SIZE.min(capacity);
    let Some(size) = requested.and_then(parse_size_hint) else {
        return default;
    };
    match usize::try_from(size) {
        Ok(size) if (params::MIN_CHUNK_SIZE..=capacity).contains(&size) => size,
        _ => default,
    }
}

/// Calibration payload size for an optional `X-Calibration-Size` value.
///
/// Positive requests are clamped to `capacity`; absent or non-positive ones
/// fall back to [`params::DEFAULT_CALIBRATION_SIZE`].
pub fn negotiate_calibration_size(requested: Option<&str>, capacity: usize) -> usize {
    let default = params::DEFAULT_CALIBRATION_SIZE.min(capacity);
    match requested.and_then(parse_size_hint) {
        Some(size) if size > 0 => usize::try_from(size).map_or(capacity, |s| s.min(capacity)),
        _ => default,
    }
}
