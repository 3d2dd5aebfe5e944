//! Request classification.
//!
//! Rules are checked in a fixed precedence and the first match wins:
//!
//! 1. path equals the configured page URL → [`RequestClassification::Page`]
//! 2. `GET` under the reserved prefix with `X-SpeedTest: ping|download`
//! 3. `POST` to the upload path with any `X-SpeedTest`
//! 4. the address lookup path
//! 5. `X-SpeedTest: calibration`, regardless of method and path
//! 6. the calibration upload path, regardless of method
//!
//! Everything else is [`RequestClassification::None`].

use axum::http::{HeaderMap, Method};

use crate::params;
use crate::protocol::{RequestClassification, TestKind};

/// Classify a request. `path` is taken as received; one trailing slash is ignored.
pub fn classify(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    speedtest_url: &str,
) -> RequestClassification {
    let path = strip_trailing_slash(path);
    let test_header = headers
        .get(params::SPEEDTEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let kind = test_header.and_then(TestKind::from_header);

    if path == strip_trailing_slash(speedtest_url) {
        return RequestClassification::Page;
    }

    if *method == Method::GET && path.starts_with(params::RESERVED_PREFIX) {
        match kind {
            Some(TestKind::Ping) => return RequestClassification::Ping,
            Some(TestKind::Download) => return RequestClassification::Download,
            _ => {}
        }
    }

    if *method == Method::POST && path == params::UPLOAD_PATH && test_header.is_some() {
        return RequestClassification::Upload;
    }

    if path == params::IP_PATH {
        return RequestClassification::IpLookup;
    }

    if kind == Some(TestKind::Calibration) {
        return RequestClassification::CalibrationDownload;
    }

    if path == params::CALIBRATION_UPLOAD_PATH {
        return RequestClassification::CalibrationUpload;
    }

    RequestClassification::None
}

fn strip_trailing_slash(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}
