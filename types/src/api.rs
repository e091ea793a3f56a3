//! Request and response bodies of the REST API.

use crate::case::decimal_string;
use serde::{Deserialize, Serialize};

/// Prefix shared by every route.
pub const API_PREFIX: &str = "api/v1";

pub mod paths {
    pub const LOGIN: &str = "auth/telegram";
    pub const REFRESH: &str = "auth/refresh";
    pub const CURRENT_USER: &str = "users/me";
    pub const CASE_LIST: &str = "cases/list";
    pub const CASE_GET_ONE: &str = "cases/get_one";
    pub const CASE_PRECHECK: &str = "cases/precheck";
    pub const CASE_OPEN: &str = "cases/open";
    pub const FAIRNESS_COMMIT: &str = "fairness/commit";
    pub const FAIRNESS_REVEAL: &str = "fairness/reveal";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub init_data: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Access/refresh pair returned by login and refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Admission check result (`GET /cases/precheck`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub spin: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Server seed commitment (`POST /fairness/commit`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment {
    pub server_seed_id: String,
    /// Hex SHA-256 of the server seed bytes.
    pub hash: String,
}

/// Body of `POST /cases/open`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub case_id: String,
    pub client_seed: String,
    pub nonce: u64,
    pub server_seed_id: String,
}

/// The prize awarded by a draw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prize {
    #[serde(default)]
    pub reward_tier: Option<String>,
    /// `(coin_id, network, amount)`.
    pub coin_amount: (String, Option<String>, String),
    #[serde(deserialize_with = "decimal_string")]
    pub usd_value: String,
}

impl Prize {
    pub fn coin_id(&self) -> &str {
        &self.coin_amount.0
    }

    pub fn network(&self) -> Option<&str> {
        self.coin_amount.1.as_deref()
    }

    pub fn amount(&self) -> &str {
        &self.coin_amount.2
    }
}

/// Outcome of a successful `open`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinResult {
    /// Revealed server seed; some deployments omit it and require a reveal.
    #[serde(default)]
    pub server_seed: Option<String>,
    pub table_id: String,
    pub odds_version: String,
    pub prize: Prize,
    #[serde(default)]
    pub spin_log_id: Option<String>,
    #[serde(default)]
    pub fail_streak: Option<u32>,
}

/// Body of `GET /fairness/reveal/{spin_log_id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reveal {
    pub server_seed: String,
    pub table_id: String,
    pub odds_version: String,
}

/// Error body of every non-success response: `{"detail": "..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}
