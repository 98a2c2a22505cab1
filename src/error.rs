use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Represents a result type for operations in the FeatureBoard SDK.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// featureboard-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the FeatureBoard SDK.
///
/// `Error` is `Clone` so that a single failed refresh can be handed to every caller that was
/// waiting on it.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid `http` or `ws` base URL configuration.
    #[error("invalid base url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The service replied with a status that is neither 200 nor 304.
    #[error("failed to get latest flags: service returned error {status} ({status_text})")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Canonical reason phrase for `status`.
        status_text: String,
    },

    /// The service asked the SDK to back off. Further refreshes are short-circuited with this
    /// error until `retry_after` has passed.
    #[error("too many requests, retry after {retry_after}")]
    TooManyRequests {
        /// Deadline before which no new request is issued.
        retry_after: DateTime<Utc>,
    },

    /// The response body could not be decoded.
    #[error("invalid response from FeatureBoard")]
    InvalidResponse(#[source] Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// No message was received over the live connection within the connect timeout.
    #[error("SDK connection timeout")]
    ConnectTimeout,

    /// The underlying transport failed to open or was torn down.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service rejected the live subscription.
    #[error("failed to subscribe: {0}")]
    SubscriptionError(String),

    /// Reading the external state store failed.
    #[error("external state store error: {0}")]
    ExternalStateStore(String),

    /// The update strategy name is not one of `manual`, `polling`, `on-request` or `live`.
    #[error("unknown update strategy: {0}")]
    UnknownUpdateStrategy(String),

    /// The requested update strategy cannot be used with this kind of client.
    #[error("{0} update strategy is not supported by this client")]
    UnsupportedUpdateStrategy(&'static str),

    /// A request client was used before its refresh completed.
    #[error("request() must be awaited when using on-request update strategy")]
    RequestNotAwaited,

    /// Background work was requested outside of a tokio runtime.
    #[error("must be called from within a tokio runtime")]
    NoRuntime,

    /// The client was closed before the operation completed.
    #[error("client closed")]
    Closed,
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidResponse(Arc::new(value))
    }
}

impl Error {
    /// Returns the retry-after deadline if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::TooManyRequests { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
