//! Protocol constants and tuning parameters.

use std::time::Duration;

/// Capacity of the shared random payload buffer (100 MiB).
pub const BUFFER_SIZE: usize = 100 * 1024 * 1024;

/// Idle time after which the payload buffer is released (30 minutes).
pub const BUFFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Download chunk size used when the client does not negotiate one (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Smallest chunk size a client may request (50 KiB).
pub const MIN_CHUNK_SIZE: usize = 50 * 1024;

/// Calibration payload size used when the client does not request one (1 MiB).
pub const DEFAULT_CALIBRATION_SIZE: usize = 1 << 20;

/// Default bound on how long an upload body may take to drain.
pub const UPLOAD_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Reserved internal path prefix shared by all test endpoints.
pub const RESERVED_PREFIX: &str = "/~";

/// Upload test sink.
pub const UPLOAD_PATH: &str = "/~/upload";

/// Client address lookup.
pub const IP_PATH: &str = "/~/ip";

/// Calibration upload sink.
pub const CALIBRATION_UPLOAD_PATH: &str = "/~/upload-calibration";

/// Login page the test page redirects anonymous visitors to.
pub const LOGIN_PATH: &str = "/~/login";

/// Base path that relative page assets are rewritten to.
pub const DEFAULT_ASSET_BASE: &str = "/~/plugins/speedtest";

/// Header selecting the test operation.
pub const SPEEDTEST_HEADER: &str = "x-speedtest";

/// Header negotiating the download chunk size in bytes.
pub const CHUNK_SIZE_HEADER: &str = "x-chunk-size";

/// Header requesting a calibration payload size in bytes.
pub const CALIBRATION_SIZE_HEADER: &str = "x-calibration-size";
