//! Per-request failover across the selected keys.
//!
//! Keys are tried strictly in selection order, each at most once. Every
//! failure of a single attempt is retryable and only consumes that key; the
//! request fails as a whole only once the selection is exhausted.

use reqwest::StatusCode;
use tracing::{error, info, warn};

use crate::credential::Credential;
use crate::selector::Selection;
use crate::upstream::{GeminiClient, GenerateContentRequest, SendError};
use crate::utils::http::response_text_truncated;
use crate::{RelayError, Result};

const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;

/// Why one key attempt failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// 429.
    RateLimited,
    /// 403: invalid key or missing permission.
    AuthRejected,
    /// Any other non-success status.
    Status(u16),
    /// No response headers within the attempt timeout.
    Timeout,
    /// Connection, TLS or protocol error.
    Network(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => f.write_str("rate limited (429)"),
            Self::AuthRejected => f.write_str("key rejected (403)"),
            Self::Status(code) => write!(f, "upstream status {code}"),
            Self::Timeout => f.write_str("timed out"),
            Self::Network(message) => write!(f, "network error: {message}"),
        }
    }
}

/// Result of classifying one attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Move on to the next key.
    Retry(FailureKind),
}

pub fn classify_status(status: StatusCode) -> AttemptOutcome {
    if status.is_success() {
        return AttemptOutcome::Succeeded;
    }
    AttemptOutcome::Retry(match status {
        StatusCode::TOO_MANY_REQUESTS => FailureKind::RateLimited,
        StatusCode::FORBIDDEN => FailureKind::AuthRejected,
        other => FailureKind::Status(other.as_u16()),
    })
}

pub fn classify_transport_error(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        FailureKind::Timeout
    } else {
        FailureKind::Network(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedAttempt {
    /// Masked key.
    pub key: String,
    pub kind: FailureKind,
}

/// A live upstream stream plus the attempts it took to get it.
#[derive(Debug)]
pub struct Dispatched {
    pub response: reqwest::Response,
    /// Masked key that succeeded.
    pub key: String,
    pub failures: Vec<FailedAttempt>,
}

impl Dispatched {
    pub fn attempts(&self) -> usize {
        self.failures.len() + 1
    }
}

#[derive(Clone, Debug)]
pub struct Dispatcher {
    client: GeminiClient,
}

impl Dispatcher {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GeminiClient {
        &self.client
    }

    /// Tries every key of `selection` until one returns a success status.
    /// Fails with [`RelayError::Exhausted`] when none does.
    pub async fn dispatch(
        &self,
        model: &str,
        envelope: &GenerateContentRequest,
        selection: &Selection,
    ) -> Result<Dispatched> {
        let mut failures = Vec::<FailedAttempt>::new();

        for (attempt, key) in selection.attempt_order().enumerate() {
            let attempt = attempt + 1;
            let masked = key.masked();
            info!(attempt, key = %masked, model, "sending upstream request");

            match self.attempt(model, envelope, key).await {
                Ok(response) => {
                    info!(attempt, key = %masked, "upstream request succeeded");
                    return Ok(Dispatched {
                        response,
                        key: masked,
                        failures,
                    });
                }
                Err(kind) => {
                    warn!(attempt, key = %masked, reason = %kind, "upstream attempt failed; trying next key");
                    failures.push(FailedAttempt { key: masked, kind });
                }
            }
        }

        error!(attempts = failures.len(), "all upstream keys failed");
        Err(RelayError::Exhausted {
            attempts: failures.len(),
            failures,
        })
    }

    async fn attempt(
        &self,
        model: &str,
        envelope: &GenerateContentRequest,
        key: &Credential,
    ) -> std::result::Result<reqwest::Response, FailureKind> {
        let response = match self.client.send_stream(model, envelope, key).await {
            Ok(response) => response,
            Err(SendError::TimedOut(after)) => {
                warn!(timeout_ms = after.as_millis() as u64, "upstream attempt timed out");
                return Err(FailureKind::Timeout);
            }
            Err(SendError::Transport(err)) => return Err(classify_transport_error(&err)),
        };

        match classify_status(response.status()) {
            AttemptOutcome::Succeeded => Ok(response),
            AttemptOutcome::Retry(kind) => {
                let status = response.status().as_u16();
                // The excerpt shares the attempt budget; a stalled body must not block failover.
                let excerpt = tokio::time::timeout(
                    self.client.attempt_timeout(),
                    response_text_truncated(response, MAX_ERROR_BODY_BYTES),
                )
                .await;
                match excerpt {
                    Ok(body) => warn!(status, body = %body, "upstream returned an error status"),
                    Err(_) => warn!(status, "upstream returned an error status; body stalled"),
                }
                Err(kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_success_statuses() {
        assert_eq!(classify_status(StatusCode::OK), AttemptOutcome::Succeeded);
    }

    #[test]
    fn classifies_failure_statuses_as_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            AttemptOutcome::Retry(FailureKind::RateLimited)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            AttemptOutcome::Retry(FailureKind::AuthRejected)
        );
        for code in [400u16, 401, 404, 500, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(
                classify_status(status),
                AttemptOutcome::Retry(FailureKind::Status(code))
            );
        }
    }

    #[test]
    fn failure_kinds_render_for_logs() {
        assert_eq!(FailureKind::RateLimited.to_string(), "rate limited (429)");
        assert_eq!(FailureKind::Status(502).to_string(), "upstream status 502");
        assert_eq!(
            FailureKind::Network("connection refused".into()).to_string(),
            "network error: connection refused"
        );
    }
}
