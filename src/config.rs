//! Speed test settings.
//!
//! The settings are owned by the host's configuration store. The dispatcher
//! only ever reads them, taking a fresh snapshot through [`ConfigProvider`]
//! on every request so that changes apply without a restart.

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Settings recognised by the speed test endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    /// Accounts or groups allowed to run the test, separated by `|`.
    #[serde(default = "default_allowed_accounts")]
    pub allowed_accounts: String,
    /// Path the test page is served on.
    #[serde(default = "default_speedtest_url")]
    pub speedtest_url: String,
    /// Download/upload phase duration in seconds, passed to the page.
    #[serde(default = "default_test_duration")]
    pub test_duration: u32,
    /// Number of latency probes, passed to the page.
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    /// Skip the access gate entirely.
    #[serde(default)]
    pub allow_anonymous: bool,
    /// Let the page resolve country and city from the client address.
    #[serde(default, rename = "enableGeoIP")]
    pub enable_geo_ip: bool,
}

fn default_allowed_accounts() -> String {
    "admin".to_string()
}

fn default_speedtest_url() -> String {
    "/speedtest".to_string()
}

fn default_test_duration() -> u32 {
    5
}

fn default_ping_count() -> u32 {
    10
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            allowed_accounts: default_allowed_accounts(),
            speedtest_url: default_speedtest_url(),
            test_duration: default_test_duration(),
            ping_count: default_ping_count(),
            allow_anonymous: false,
            enable_geo_ip: false,
        }
    }
}

impl TestConfig {
    /// Load settings from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Allowed accounts and groups, trimmed, empty entries dropped.
    pub fn allowed_accounts(&self) -> Vec<&str> {
        self.allowed_accounts
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Source of the current settings.
pub trait ConfigProvider: Send + Sync {
    /// Snapshot of the settings at this moment.
    fn current(&self) -> TestConfig;
}

impl ConfigProvider for TestConfig {
    fn current(&self) -> TestConfig {
        self.clone()
    }
}

/// Settings that can be replaced while the server runs.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<TestConfig>>,
}

impl SharedConfig {
    /// Start from `config`.
    pub fn new(config: TestConfig) -> Self {
        SharedConfig {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Replace the settings; subsequent requests observe the new values.
    pub fn update(&self, config: TestConfig) {
        match self.inner.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl ConfigProvider for SharedConfig {
    fn current(&self) -> TestConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
