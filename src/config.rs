//! Configuration for the client, its retry behaviour and the flush policy

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// Default API base URL
pub const DEFAULT_URL: &str = "https://api.axiom.co";

/// Longest accepted flush interval. Flush deadlines are computed as
/// `Instant + interval`, which must not overflow.
pub const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Connection settings shared by the async and blocking clients
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API or personal token used as bearer credential
    pub token: String,

    /// Organization ID, required for personal tokens
    pub org_id: Option<String>,

    /// Base URL of the API
    pub url: String,

    /// Regional edge URL used for ingest and query calls
    pub edge_url: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,

    /// Retry behaviour for transient failures
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry, doubled for each further retry
    pub backoff_base: Duration,

    /// Add up to half of the delay as random jitter
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlushPolicy {
    /// Flush as soon as this many records are buffered
    pub max_batch_size: usize,

    /// Wall-clock time between timer-triggered flushes
    pub flush_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            org_id: None,
            url: DEFAULT_URL.to_string(),
            edge_url: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = if self.token.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("ClientConfig")
            .field("token", &token)
            .field("org_id", &self.org_id)
            .field("url", &self.url)
            .field("edge_url", &self.edge_url)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Default configuration authenticating with `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Scope requests to an organization
    pub fn with_org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    /// Override the API base URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Route ingest and query calls to a regional edge; an empty value disables it
    pub fn with_edge_url(mut self, edge_url: impl Into<String>) -> Self {
        let edge_url = edge_url.into();
        self.edge_url = (!edge_url.is_empty()).then_some(edge_url);
        self
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load configuration from environment variables
    ///
    /// The edge URL is never read here; edge routing must be configured
    /// explicitly with [`ClientConfig::with_edge_url`].
    pub fn from_env() -> Self {
        let mut config = ClientConfig::default();

        if let Ok(token) = env::var("AXIOM_TOKEN") {
            config.token = token;
        }

        if let Ok(org_id) = env::var("AXIOM_ORG_ID") {
            if !org_id.is_empty() {
                config.org_id = Some(org_id);
            }
        }

        if let Ok(url) = env::var("AXIOM_URL") {
            if !url.is_empty() {
                config.url = url;
            }
        }

        if let Ok(timeout) = env::var("AXIOM_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.timeout = Duration::from_secs(seconds);
            }
        }

        config.retry = RetryPolicy::from_env();
        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.token.is_empty() {
            return Err("token cannot be empty".to_string());
        }

        if self.url.is_empty() {
            return Err("url cannot be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!("url must be http(s), got {}", self.url));
        }

        if let Some(edge_url) = &self.edge_url {
            if !edge_url.starts_with("http://") && !edge_url.starts_with("https://") {
                return Err(format!("edge_url must be http(s), got {}", edge_url));
            }
        }

        if self.timeout.is_zero() {
            return Err("timeout must be greater than 0".to_string());
        }

        self.retry.validate()
    }

    /// Whether the configured token is a personal token
    pub fn is_personal_token(&self) -> bool {
        self.token.starts_with("xapt-")
    }
}

impl RetryPolicy {
    /// Read `AXIOM_MAX_ATTEMPTS` and `AXIOM_RETRY_BACKOFF_MS`, ignoring invalid values
    pub fn from_env() -> Self {
        let mut policy = RetryPolicy::default();

        if let Ok(attempts) = env::var("AXIOM_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                policy.max_attempts = attempts;
            }
        }

        if let Ok(backoff) = env::var("AXIOM_RETRY_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse::<u64>() {
                policy.backoff_base = Duration::from_millis(ms);
            }
        }

        policy
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1 << exponent);

        if self.jitter && !delay.is_zero() {
            let max_jitter = delay.as_millis() as u64 / 2;
            let jitter = rand::random_range(0..=max_jitter);
            delay + Duration::from_millis(jitter)
        } else {
            delay
        }
    }
}

impl FlushPolicy {
    /// Read `AXIOM_MAX_BATCH_SIZE` and `AXIOM_FLUSH_INTERVAL_SECONDS`, ignoring invalid values
    pub fn from_env() -> Self {
        let mut policy = FlushPolicy::default();

        if let Ok(batch_size) = env::var("AXIOM_MAX_BATCH_SIZE") {
            if let Ok(size) = batch_size.parse() {
                policy.max_batch_size = size;
            }
        }

        if let Ok(interval) = env::var("AXIOM_FLUSH_INTERVAL_SECONDS") {
            if let Some(interval) = parse_flush_interval(&interval) {
                policy.flush_interval = interval;
            }
        }

        policy
    }

    /// Reject an empty batch size and zero or overlong intervals
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".to_string());
        }

        if self.flush_interval.is_zero() {
            return Err("flush_interval must be greater than 0".to_string());
        }

        if self.flush_interval > MAX_FLUSH_INTERVAL {
            return Err(format!(
                "flush_interval must be at most {}s",
                MAX_FLUSH_INTERVAL.as_secs()
            ));
        }

        Ok(())
    }
}

/// Parse a positive number of seconds; out-of-range values yield `None`.
fn parse_flush_interval(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    let interval = Duration::try_from_secs_f64(seconds).ok()?;
    (!interval.is_zero() && interval <= MAX_FLUSH_INTERVAL).then_some(interval)
}
