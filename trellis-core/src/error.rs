//! The transport-agnostic failure taxonomy.
//!
//! Every failure that crosses the request path is an [`Error`] with a
//! [`Kind`]. The kind fixes three mappings at once: the HTTP status, the
//! RPC status code, and whether the circuit breaker counts the outcome as
//! a failure. Client/business failures (4xx) never feed breaker statistics.

use std::fmt;

/// Failure classification carried by every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    InvalidArgument,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    CircuitOpen,
    Canceled,
    DeadlineExceeded,
    Internal,
    Unavailable,
}

impl Kind {
    /// The HTTP status this kind maps to. `Canceled` uses nginx's 499
    /// (client closed request), which has no `http::StatusCode` constant.
    pub fn http_status(self) -> u16 {
        match self {
            Kind::InvalidArgument => 400,
            Kind::Unauthenticated => 401,
            Kind::Forbidden => 403,
            Kind::NotFound => 404,
            Kind::Conflict => 409,
            Kind::RateLimited => 429,
            Kind::CircuitOpen => 503,
            Kind::Canceled => 499,
            Kind::DeadlineExceeded => 504,
            Kind::Internal => 500,
            Kind::Unavailable => 503,
        }
    }

    /// The RPC status code string used in error envelopes.
    pub fn rpc_code(self) -> &'static str {
        match self {
            Kind::InvalidArgument => "InvalidArgument",
            Kind::Unauthenticated => "Unauthenticated",
            Kind::Forbidden => "PermissionDenied",
            Kind::NotFound => "NotFound",
            Kind::Conflict => "AlreadyExists",
            Kind::RateLimited => "ResourceExhausted",
            Kind::CircuitOpen => "Unavailable",
            Kind::Canceled => "Canceled",
            Kind::DeadlineExceeded => "DeadlineExceeded",
            Kind::Internal => "Internal",
            Kind::Unavailable => "Unavailable",
        }
    }

    /// Whether the breaker records this outcome as an error. Only
    /// server-side failures count; rejections produced by the protection
    /// layer itself never bias its own statistics.
    pub fn counts_for_breaker(self) -> bool {
        matches!(
            self,
            Kind::DeadlineExceeded | Kind::Internal | Kind::Unavailable
        )
    }

    /// Label used in metrics and structured logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::InvalidArgument => "invalid_argument",
            Kind::Unauthenticated => "unauthenticated",
            Kind::Forbidden => "forbidden",
            Kind::NotFound => "not_found",
            Kind::Conflict => "conflict",
            Kind::RateLimited => "rate_limited",
            Kind::CircuitOpen => "circuit_open",
            Kind::Canceled => "canceled",
            Kind::DeadlineExceeded => "deadline_exceeded",
            Kind::Internal => "internal",
            Kind::Unavailable => "unavailable",
        }
    }
}

/// A typed failure flowing back through the canonical chain.
#[derive(Debug, Clone)]
pub struct Error {
    kind: Kind,
    message: String,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidArgument, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Kind::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Kind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Kind::Conflict, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(Kind::RateLimited, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(Kind::CircuitOpen, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(Kind::Canceled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Kind::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Kind::Unavailable, message)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.rpc_code(), self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(Kind::InvalidArgument.http_status(), 400);
        assert_eq!(Kind::Unauthenticated.http_status(), 401);
        assert_eq!(Kind::Forbidden.http_status(), 403);
        assert_eq!(Kind::NotFound.http_status(), 404);
        assert_eq!(Kind::Conflict.http_status(), 409);
        assert_eq!(Kind::RateLimited.http_status(), 429);
        assert_eq!(Kind::CircuitOpen.http_status(), 503);
        assert_eq!(Kind::Canceled.http_status(), 499);
        assert_eq!(Kind::DeadlineExceeded.http_status(), 504);
        assert_eq!(Kind::Internal.http_status(), 500);
        assert_eq!(Kind::Unavailable.http_status(), 503);
    }

    #[test]
    fn only_server_failures_count_for_breaker() {
        let counted = [Kind::DeadlineExceeded, Kind::Internal, Kind::Unavailable];
        let not_counted = [
            Kind::InvalidArgument,
            Kind::Unauthenticated,
            Kind::Forbidden,
            Kind::NotFound,
            Kind::Conflict,
            Kind::RateLimited,
            Kind::CircuitOpen,
            Kind::Canceled,
        ];
        for kind in counted {
            assert!(kind.counts_for_breaker(), "{kind:?} must count");
        }
        for kind in not_counted {
            assert!(!kind.counts_for_breaker(), "{kind:?} must not count");
        }
    }

    #[test]
    fn display_carries_code_and_message() {
        let err = Error::not_found("user 7 does not exist");
        assert_eq!(err.to_string(), "NotFound: user 7 does not exist");
    }

    #[test]
    fn io_error_becomes_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert_eq!(err.kind(), Kind::Internal);
    }
}
