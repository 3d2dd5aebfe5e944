//! Access control for the speed test endpoints.
//!
//! Authentication belongs to the host: it attaches an [`Identity`] to the
//! request when a session is present, and answers membership questions
//! through the [`Host`] trait. This module only decides what to do with
//! that information.

use url::form_urlencoded;

use crate::config::TestConfig;
use crate::params;
use crate::protocol::RequestClassification;

/// Authenticated account as supplied by the host.
///
/// The host inserts it into the request extensions; its absence means the
/// request is anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    /// Account name.
    pub username: String,
    /// Groups the account is a member of.
    pub groups: Vec<String>,
}

impl Identity {
    /// Identity with no group memberships.
    pub fn new(username: impl Into<String>) -> Self {
        Identity {
            username: username.into(),
            groups: Vec::new(),
        }
    }

    /// Add group memberships.
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }
}

/// Services the surrounding host process provides to the dispatcher.
pub trait Host: Send + Sync {
    /// Whether `identity` is one of, or a member of one of, `allowed`.
    ///
    /// The default matches the account name and its direct groups.
    fn belongs_to(&self, identity: &Identity, allowed: &[&str]) -> bool {
        allowed
            .iter()
            .any(|entry| *entry == identity.username || identity.groups.iter().any(|g| g == entry))
    }

    /// Record a failure in the host's error log.
    fn record_error(&self, _message: &str) {}
}

/// Host with default membership rules and no separate error log.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneHost;

impl Host for StandaloneHost {}

/// Outcome of the access gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Proceed to the handler.
    Allow,
    /// Send the visitor to the login page.
    RedirectToLogin {
        /// Login URL including the return path.
        location: String,
    },
    /// No identity on a gated endpoint.
    Unauthenticated,
    /// Identity present but not in the allowed set.
    Forbidden,
}

/// Decide whether a request may proceed.
///
/// `path` is the request path as received and becomes the login return path.
pub fn evaluate(
    classification: RequestClassification,
    path: &str,
    identity: Option<&Identity>,
    config: &TestConfig,
    host: &dyn Host,
) -> AccessDecision {
    if config.allow_anonymous || classification.bypasses_gate() {
        return AccessDecision::Allow;
    }

    let Some(identity) = identity.filter(|id| !id.username.is_empty()) else {
        return if classification == RequestClassification::Page {
            AccessDecision::RedirectToLogin {
                location: login_location(path),
            }
        } else {
            AccessDecision::Unauthenticated
        };
    };

    if host.belongs_to(identity, &config.allowed_accounts()) {
        AccessDecision::Allow
    } else {
        AccessDecision::Forbidden
    }
}

fn login_location(path: &str) -> String {
    let from: String = form_urlencoded::byte_serialize(path.as_bytes()).collect();
    format!("{}?from={from}", params::LOGIN_PATH)
}
