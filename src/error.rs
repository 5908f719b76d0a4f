use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("upstream unavailable from {provider}: {message}")]
    UpstreamUnavailable { provider: String, message: String },

    #[error("upstream protocol error from {provider}: {message}")]
    UpstreamProtocol { provider: String, message: String },

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("stream already stopped")]
    AlreadyStopped,

    #[error("stream already completed")]
    AlreadyCompleted,

    #[error("persistence queue full")]
    QueueFull,

    #[error("service shutting down")]
    ShuttingDown,

    #[error("encryption required but no usable public key for {0}")]
    EncryptionRequired(String),

    #[error("invalid public key: {0}")]
    PublicKeyInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::UpstreamUnavailable { provider, .. } => Some(provider),
            Self::UpstreamProtocol { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Produce a sanitized error message safe for returning to clients.
    /// Does not leak internal URLs, credentials, or raw upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnknownModel(model) => format!("unknown model: {model}"),
            Self::UpstreamUnavailable { provider, .. } => {
                format!("provider {provider} is unavailable")
            }
            Self::UpstreamProtocol { provider, .. } => {
                format!("provider {provider} returned a malformed response")
            }
            Self::Cancelled(ms) => format!("request cancelled after {ms}ms"),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::AlreadyStopped => "stream already stopped".to_string(),
            Self::AlreadyCompleted => "stream already completed".to_string(),
            Self::QueueFull => "server is overloaded — try again shortly".to_string(),
            Self::ShuttingDown => "server is shutting down".to_string(),
            Self::EncryptionRequired(_) => {
                "encryption required but no usable public key".to_string()
            }
            Self::PublicKeyInvalid(_) => "stored public key is invalid".to_string(),
            Self::NotFound(what) => format!("not found: {what}"),
            Self::BadRequest(msg) => msg.clone(),
            Self::Configuration(_) => "server misconfiguration".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }

    /// HTTP status for the boundary error mapping.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownModel(_) | Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::AlreadyStopped | Self::AlreadyCompleted => 409,
            Self::UpstreamUnavailable { .. }
            | Self::UpstreamProtocol { .. }
            | Self::Request(_) => 502,
            Self::QueueFull | Self::ShuttingDown => 503,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }
}
