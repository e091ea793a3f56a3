use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1/";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_REFRESH_ATTEMPTS: u32 = 3;
pub const DEFAULT_REFRESH_BACKOFF: Duration = Duration::from_millis(250);

/// Client settings. Environment first, CLI flags override.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Refresh calls attempted within one refresh cycle before the session
    /// is declared expired.
    pub max_refresh_attempts: u32,
    #[serde(with = "millis")]
    pub refresh_backoff: Duration,
    pub token_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_refresh_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
            refresh_backoff: DEFAULT_REFRESH_BACKOFF,
            token_path: None,
        }
    }
}

fn read_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|raw| raw.trim().parse::<u64>().ok())
}

fn read_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: read_string("CASEBOX_BASE_URL").unwrap_or(defaults.base_url),
            request_timeout: read_u64("CASEBOX_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            max_refresh_attempts: read_u64("CASEBOX_MAX_REFRESH_ATTEMPTS")
                .map(|value| value.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_refresh_attempts),
            refresh_backoff: read_u64("CASEBOX_REFRESH_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.refresh_backoff),
            token_path: read_string("CASEBOX_TOKEN_PATH").map(PathBuf::from),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_refresh_attempts(mut self, attempts: u32) -> Self {
        self.max_refresh_attempts = attempts.max(1);
        self
    }

    pub fn with_refresh_backoff(mut self, backoff: Duration) -> Self {
        self.refresh_backoff = backoff;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
