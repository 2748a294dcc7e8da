//! Error taxonomy shared by every component.
//!
//! Transports fail with a [`RawError`]; the classifier turns it into a [`ClassifiedError`] whose
//! [`ErrorKind`] drives retry, breaker, degradation, and queueing decisions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    Authorization,
    Service,
    CircuitOpen,
}

impl ErrorKind {
    /// Kinds that say something about dependency health and count toward opening a breaker.
    pub fn trips_breaker(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Service)
    }

    /// Kinds that mean the request never got a usable answer, so a write should be deferred.
    pub fn is_connectivity(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Service | ErrorKind::CircuitOpen
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Service => "service",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw failure normalized into the fixed taxonomy. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error ({code}): {message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    code: String,
    recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<Map<String, Value>>,
}

impl ClassifiedError {
    pub fn new(
        kind: ErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            code: code.into(),
            recoverable,
            retry_after_seconds: None,
            details: None,
        }
    }

    /// Rejection produced by an open breaker; `remaining` is the cooldown left.
    pub fn circuit_open(context_key: &str, remaining: Duration) -> Self {
        let mut details = Map::new();
        details.insert("context_key".into(), Value::from(context_key));
        details.insert("remaining_ms".into(), Value::from(remaining.as_millis() as u64));
        Self {
            kind: ErrorKind::CircuitOpen,
            message: format!("circuit breaker for '{context_key}' is open"),
            code: "CIRCUIT_OPEN".into(),
            recoverable: true,
            retry_after_seconds: Some(remaining.as_secs_f64().ceil() as u64),
            details: Some(details),
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.get_or_insert_with(Map::new).insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_seconds.map(Duration::from_secs)
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after_seconds
    }

    pub fn details(&self) -> Option<&Map<String, Value>> {
        self.details.as_ref()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }
}

/// Why a connection never produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    Dns,
    Refused,
    Reset,
    Other,
}

/// gRPC-style status codes for transports that speak RPC rather than HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    Unknown,
}

/// Unclassified failure as reported by a transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RawError {
    /// The service answered with an HTTP-like status.
    #[error("status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Parsed `Retry-After` header, in seconds.
        retry_after: Option<u64>,
        details: Option<Map<String, Value>>,
    },
    /// The service answered with an RPC status code.
    #[error("rpc {code:?}: {message}")]
    Rpc { code: RpcCode, message: String, retry_after: Option<u64> },
    /// The transport gave up waiting.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The request was aborted before completion.
    #[error("request aborted")]
    Aborted,
    /// No response was received.
    #[error("connection failed ({kind:?}): {message}")]
    Connection { kind: ConnectionFailure, message: String },
    /// The request or response failed structural validation before or after transport.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Opaque failure with no response attached.
    #[error("{0}")]
    Other(String),
    /// Already classified; passes through the classifier unchanged.
    #[error(transparent)]
    Classified(ClassifiedError),
}

impl RawError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        RawError::Status { status, message: message.into(), retry_after: None, details: None }
    }

    pub fn status_with_retry_after(status: u16, message: impl Into<String>, seconds: u64) -> Self {
        RawError::Status {
            status,
            message: message.into(),
            retry_after: Some(seconds),
            details: None,
        }
    }

    pub fn connection(kind: ConnectionFailure, message: impl Into<String>) -> Self {
        RawError::Connection { kind, message: message.into() }
    }
}

impl From<ClassifiedError> for RawError {
    fn from(err: ClassifiedError) -> Self {
        RawError::Classified(err)
    }
}

impl From<std::io::Error> for RawError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let message = err.to_string();
        match err.kind() {
            Io::TimedOut | Io::WouldBlock => RawError::Timeout(message),
            Io::Interrupted => RawError::Aborted,
            Io::ConnectionRefused => RawError::connection(ConnectionFailure::Refused, message),
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe => {
                RawError::connection(ConnectionFailure::Reset, message)
            }
            Io::NotConnected | Io::AddrNotAvailable | Io::AddrInUse => {
                RawError::connection(ConnectionFailure::Other, message)
            }
            Io::InvalidData | Io::InvalidInput | Io::UnexpectedEof => RawError::Malformed(message),
            _ => RawError::Other(message),
        }
    }
}

/// Optional context folded into a classified error's details.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub context_key: Option<String>,
}

impl ErrorContext {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self { operation: Some(operation.into()), context_key: None }
    }

    pub fn with_context_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = Some(key.into());
        self
    }
}
