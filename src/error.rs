//! Contains the `Error` and `Result` types that `netfabric` uses.

use std::{collections::HashMap, sync::Arc, time::Duration};

use thiserror::Error;

use crate::options::Address;

/// The result type for all methods that can return an error in the `netfabric` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `netfabric` crate. The inner
/// [`ErrorKind`] is wrapped in a `Box` to keep the type small; the whole
/// error is cheaply cloneable so that it can be latched on connections and
/// replayed to multiple observers.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    /// Free-form key/value context attached while the error propagated.
    context: HashMap<String, String>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            context: HashMap::new(),
            source: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn validation(message: impl Into<String>) -> Error {
        ErrorKind::Validation {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Timeout.into()
    }

    pub(crate) fn resource_closed(resource: impl Into<String>) -> Error {
        ErrorKind::ResourceClosed {
            resource: resource.into(),
        }
        .into()
    }

    /// Attaches a key/value pair to the error's context map, returning the
    /// modified error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    /// The context map attached to this error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// A stable, machine-readable code string identifying the class of
    /// failure. Codes are dot-separated (`"network.refused"`,
    /// `"pool.exhausted"`, ...) and do not change between releases.
    pub fn code(&self) -> &'static str {
        match self.kind.as_ref() {
            ErrorKind::Validation { .. } => "validation",
            ErrorKind::ConnectionRefused { .. } => "network.refused",
            ErrorKind::Timeout => "network.timeout",
            ErrorKind::NetworkUnreachable { .. } => "network.unreachable",
            ErrorKind::HostUnreachable { .. } => "network.host_unreachable",
            ErrorKind::DnsResolve { .. } => "network.dns",
            ErrorKind::Io(..) => "network.unknown",
            ErrorKind::HandshakeFailure { .. } => "security.handshake_failure",
            ErrorKind::PolicyDenied { .. } => "security.policy_denied",
            ErrorKind::PoolExhausted { .. } => "pool.exhausted",
            ErrorKind::PoolClosed => "pool.closed",
            ErrorKind::CircuitOpen { .. } => "breaker.open",
            ErrorKind::RateLimitExceeded { .. } => "rate_limit.exceeded",
            ErrorKind::ResourceClosed { .. } => "resource.closed",
            ErrorKind::Cancelled => "cancellation.context",
            ErrorKind::Panic { .. } => "internal.panic",
            ErrorKind::Internal { .. } => "internal",
        }
    }

    /// A short user-facing hint for recovering from this error, when one
    /// exists.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self.kind.as_ref() {
            ErrorKind::ConnectionRefused { .. } => {
                Some("verify that the target service is running and listening on that port")
            }
            ErrorKind::Timeout => {
                Some("the target may be slow or unreachable; consider raising the timeout")
            }
            ErrorKind::DnsResolve { .. } => {
                Some("check the hostname spelling and your resolver configuration")
            }
            ErrorKind::CircuitOpen { .. } => {
                Some("the target has failed repeatedly; wait for the cool-down to elapse")
            }
            ErrorKind::PoolExhausted { .. } => {
                Some("all pooled connections are in use; return connections or raise max_size")
            }
            ErrorKind::RateLimitExceeded { .. } => {
                Some("traffic exceeded the configured rate; slow down or raise the limit")
            }
            _ => None,
        }
    }

    /// Whether the retrying dialer may transparently retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::ConnectionRefused { .. }
                | ErrorKind::Timeout
                | ErrorKind::NetworkUnreachable { .. }
                | ErrorKind::Io(..)
        )
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::ConnectionRefused { .. }
                | ErrorKind::Timeout
                | ErrorKind::NetworkUnreachable { .. }
                | ErrorKind::HostUnreachable { .. }
                | ErrorKind::DnsResolve { .. }
                | ErrorKind::Io(..)
        )
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Cancelled)
    }

    /// Whether the error indicates the peer or the local side closed the
    /// byte stream. Connections latch into the `Closed` state on these.
    pub(crate) fn is_closed_class(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::ResourceClosed { .. } | ErrorKind::Cancelled => true,
            ErrorKind::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn message(&self) -> Option<String> {
        match self.kind.as_ref() {
            ErrorKind::Validation { message }
            | ErrorKind::DnsResolve { message }
            | ErrorKind::HandshakeFailure { message }
            | ErrorKind::PolicyDenied { message }
            | ErrorKind::RateLimitExceeded { message }
            | ErrorKind::Panic { message }
            | ErrorKind::Internal { message } => Some(message.clone()),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into())
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        use std::io;

        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused { address: None },
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::NetworkUnreachable => Self::NetworkUnreachable { address: None },
            io::ErrorKind::HostUnreachable => Self::HostUnreachable { address: None },
            _ => Self::Io(Arc::new(err)),
        }
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        std::io::Error::from(err).into()
    }
}

impl From<tokio::time::error::Elapsed> for ErrorKind {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

#[cfg(feature = "dns-resolver")]
impl From<hickory_resolver::ResolveError> for ErrorKind {
    fn from(err: hickory_resolver::ResolveError) -> Self {
        Self::DnsResolve {
            message: err.to_string(),
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A host, port, or address failed validation before any I/O happened.
    #[error("invalid target: {message}")]
    #[non_exhaustive]
    Validation { message: String },

    /// The remote actively refused the connection.
    #[error("connection refused{}", display_address(.address))]
    #[non_exhaustive]
    ConnectionRefused { address: Option<Address> },

    /// An operation exceeded its time budget.
    #[error("operation timed out")]
    Timeout,

    /// The network is unreachable from this host.
    #[error("network unreachable{}", display_address(.address))]
    #[non_exhaustive]
    NetworkUnreachable { address: Option<Address> },

    /// No route to the target host.
    #[error("host unreachable{}", display_address(.address))]
    #[non_exhaustive]
    HostUnreachable { address: Option<Address> },

    /// An error occurred during DNS resolution.
    #[error("DNS resolution failed: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    /// Wrapper around [`std::io::Error`] values that don't map onto a more
    /// specific network kind.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The TLS handshake failed.
    #[error("TLS handshake failed: {message}")]
    #[non_exhaustive]
    HandshakeFailure { message: String },

    /// A security policy rejected the operation.
    #[error("denied by policy: {message}")]
    #[non_exhaustive]
    PolicyDenied { message: String },

    /// Every slot in the target's pool bucket is checked out.
    #[error("connection pool for {address} is exhausted")]
    #[non_exhaustive]
    PoolExhausted { address: Address },

    /// The pool has been closed.
    #[error("connection pool has been closed")]
    PoolClosed,

    /// The per-target circuit breaker is open.
    #[error("circuit breaker for {target} is open{}", display_retry_after(.retry_after))]
    #[non_exhaustive]
    CircuitOpen {
        target: String,
        retry_after: Option<Duration>,
    },

    /// A rate limiter starved the operation.
    #[error("rate limit exceeded: {message}")]
    #[non_exhaustive]
    RateLimitExceeded { message: String },

    /// The connection or listener was already closed.
    #[error("{resource} is closed")]
    #[non_exhaustive]
    ResourceClosed { resource: String },

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A panic was recovered from user-supplied code.
    #[error("panic recovered: {message}")]
    #[non_exhaustive]
    Panic { message: String },

    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

fn display_address(address: &Option<Address>) -> String {
    match address {
        Some(address) => format!(" by {}", address),
        None => String::new(),
    }
}

fn display_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry in {:?})", d),
        None => String::new(),
    }
}

impl ErrorKind {
    /// Attach the dialed address to network kinds that carry one.
    pub(crate) fn with_address(self, address: Address) -> Self {
        match self {
            Self::ConnectionRefused { .. } => Self::ConnectionRefused {
                address: Some(address),
            },
            Self::NetworkUnreachable { .. } => Self::NetworkUnreachable {
                address: Some(address),
            },
            Self::HostUnreachable { .. } => Self::HostUnreachable {
                address: Some(address),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Error, ErrorKind};

    #[test]
    fn io_errors_classify_into_network_kinds() {
        let refused: Error = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert_eq!(refused.code(), "network.refused");
        assert!(refused.is_retryable());

        let timed_out: Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(timed_out.code(), "network.timeout");
        assert!(timed_out.is_retryable());

        let other: Error = std::io::Error::other("strange").into();
        assert_eq!(other.code(), "network.unknown");
        assert!(other.is_retryable());
    }

    #[test]
    fn terminal_kinds_are_not_retryable() {
        let dns: Error = ErrorKind::DnsResolve {
            message: "nxdomain".to_string(),
        }
        .into();
        assert!(!dns.is_retryable());

        let validation = Error::validation("bad host");
        assert!(!validation.is_retryable());

        let open: Error = ErrorKind::CircuitOpen {
            target: "example:80".to_string(),
            retry_after: None,
        }
        .into();
        assert!(!open.is_retryable());
        assert_eq!(open.code(), "breaker.open");
    }

    #[test]
    fn context_round_trips() {
        let err = Error::internal("boom").with_context("operation", "dial");
        assert_eq!(
            err.context().get("operation").map(String::as_str),
            Some("dial")
        );
    }
}
