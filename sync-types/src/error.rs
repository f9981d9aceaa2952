//! Error types for mirror-sync.

use thiserror::Error;

/// How a failure should be treated by retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorClass {
    /// Connection-level failure (DNS, reset, refused).
    Network,
    /// Upstream throttling (HTTP 429).
    RateLimit,
    /// Upstream 5xx.
    ServerError,
    /// Request or gateway timeout.
    Timeout,
    /// Credentials rejected (HTTP 401); a token refresh may fix it.
    AuthExpired,
    /// Any other failure known to be temporary.
    Transient,
    /// The request itself is invalid.
    Validation,
    /// Permanent failure; retrying cannot help.
    Permanent,
    /// Unclassified failure.
    Unknown,
}

impl ErrorClass {
    /// Default retry decision for this class.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::RateLimit
                | Self::ServerError
                | Self::Timeout
                | Self::AuthExpired
                | Self::Transient
        )
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::AuthExpired,
            408 | 504 => Self::Timeout,
            429 => Self::RateLimit,
            500 | 502 | 503 => Self::ServerError,
            400 | 422 => Self::Validation,
            _ => Self::Permanent,
        }
    }
}

/// Errors that know their retry class.
pub trait Classify {
    /// The retry class of this error.
    fn classify(&self) -> ErrorClass;
}

// Bare strings carry no structure, so nothing marks them as retryable.
impl Classify for String {
    fn classify(&self) -> ErrorClass {
        ErrorClass::Unknown
    }
}

impl Classify for &str {
    fn classify(&self) -> ErrorClass {
        ErrorClass::Unknown
    }
}

/// Authentication failures. The variant tells callers whether to offer
/// "try again" or "re-enter credentials".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The user dismissed the consent screen.
    #[error("authorization cancelled by user")]
    UserCancelled,

    /// The provider could not be reached.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The provider rejected the client or the grant.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The access token has expired and cannot be used.
    #[error("token expired")]
    TokenExpired,

    /// A refresh was attempted and failed; existing tokens are unchanged.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The provider has no usable OAuth configuration.
    #[error("invalid OAuth configuration: {0}")]
    InvalidConfig(String),

    /// Anything else.
    #[error("authentication error: {0}")]
    Unknown(String),
}

impl Classify for AuthError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::NetworkError(_) => ErrorClass::Network,
            Self::TokenExpired => ErrorClass::AuthExpired,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Failures reported by a remote item source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The provider answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The request never completed at the transport level.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The provider answered with something that could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// No credentials are available for a provider that requires them.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Classify for RemoteError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::Http { status, .. } => ErrorClass::from_status(*status),
            Self::Network(_) => ErrorClass::Network,
            Self::Timeout => ErrorClass::Timeout,
            Self::InvalidResponse(_) => ErrorClass::Validation,
            Self::NotAuthenticated => ErrorClass::Permanent,
            Self::Other(_) => ErrorClass::Unknown,
        }
    }
}

/// Failures of a persistence backend (local mirror, records, credentials).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend could not be reached or opened.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Reading or writing failed.
    #[error("store I/O error: {0}")]
    Io(String),

    /// Stored data could not be decoded.
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

impl Classify for StoreError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) => ErrorClass::Transient,
            Self::Io(_) | Self::Corrupt(_) => ErrorClass::Permanent,
        }
    }
}
