pub mod cases;
pub mod client;
pub mod config;
pub mod draw;
pub mod fairness;
pub mod gateway;
pub mod store;

pub use client::Client;
pub use config::ClientConfig;
pub use draw::{DrawController, DrawPhase, DrawSnapshot, DrawState, OpenOutcome};
pub use gateway::{ApiRequest, Gateway, SessionEvent, SessionSnapshot, SessionStatus};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};

use casebox_types::Mismatch;
use reqwest::StatusCode;
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unauthorized: {status}: {body}")]
    Unauthorized { status: StatusCode, body: String },
    #[error("failed: {status}: {body}")]
    FailedWithBody { status: StatusCode, body: String },
    #[error("admission denied: {reason}")]
    AdmissionDenied { reason: String },
    #[error("draw rejected: {status}: {message}")]
    DrawRejected { status: StatusCode, message: String },
    #[error("verification failed: {0}")]
    VerificationMismatch(#[from] Mismatch),
    #[error("session expired, log in again")]
    SessionExhausted,
    #[error("token refresh failed: {0}")]
    RefreshRejected(String),
    #[error("an authentication attempt is already in flight")]
    AuthInFlight,
    #[error("session was reset while the request was waiting")]
    SessionReset,
    #[error("invalid data: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("commitment {0} was already consumed")]
    CommitmentConsumed(String),
    #[error("lifecycle was reset, result discarded")]
    Cancelled,
    #[error("token store error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Coarse classification used by callers to pick a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout or connectivity. Retriable by the user, never retried here.
    NetworkFailure,
    /// 401 that survived the transparent refresh and replay.
    AuthenticationFailure,
    AdmissionDenied,
    /// The server refused `open`; the commitment is spent.
    DrawRejected,
    VerificationMismatch,
    /// Refresh failed or the session is already expired.
    SessionExhausted,
    /// Any other non-success response.
    Request,
    /// The caller used the API out of order, or the result was discarded.
    Usage,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::NetworkFailure,
            Error::Unauthorized { .. } => ErrorKind::AuthenticationFailure,
            Error::AdmissionDenied { .. } => ErrorKind::AdmissionDenied,
            Error::DrawRejected { .. } => ErrorKind::DrawRejected,
            Error::VerificationMismatch(_) => ErrorKind::VerificationMismatch,
            Error::SessionExhausted | Error::RefreshRejected(_) | Error::SessionReset => {
                ErrorKind::SessionExhausted
            }
            Error::FailedWithBody { .. } | Error::InvalidData(_) => ErrorKind::Request,
            Error::Url(_)
            | Error::InvalidScheme(_)
            | Error::InvalidState { .. }
            | Error::CommitmentConsumed(_)
            | Error::AuthInFlight
            | Error::Cancelled => ErrorKind::Usage,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_follow_taxonomy() {
        assert_eq!(
            Error::Unauthorized {
                status: StatusCode::UNAUTHORIZED,
                body: String::new()
            }
            .kind(),
            ErrorKind::AuthenticationFailure
        );
        assert_eq!(
            Error::RefreshRejected("expired".into()).kind(),
            ErrorKind::SessionExhausted
        );
        assert_eq!(Error::SessionExhausted.kind(), ErrorKind::SessionExhausted);
        assert_eq!(
            Error::AdmissionDenied {
                reason: "reserve_exhausted".into()
            }
            .kind(),
            ErrorKind::AdmissionDenied
        );
        assert_eq!(
            Error::VerificationMismatch(Mismatch::RevealDisagrees).kind(),
            ErrorKind::VerificationMismatch
        );
    }

    #[test]
    fn test_error_messages_keep_server_text() {
        let err = Error::DrawRejected {
            status: StatusCode::PAYMENT_REQUIRED,
            message: "insufficient_balance".into(),
        };
        assert_eq!(
            err.to_string(),
            "draw rejected: 402 Payment Required: insufficient_balance"
        );
    }
}
