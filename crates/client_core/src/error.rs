use thiserror::Error;

/// Failures talking to the notification HTTP collaborators. None of these are
/// fatal; callers degrade to the previous state and refetch later.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("notification gateway is not configured yet")]
    NotConfigured,
    #[error("notification endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
}
