//! Shared error types for the hive runtime.
//!
//! Every error kind maps onto a `u16` wire code (see [`codes`]) so that a
//! failed request can be answered with a `ResponseFail` frame.

use thiserror::Error;

/// Wire error codes carried by `ResponseFail` frames.
///
/// Codes below [`RESERVED_CODE_LIMIT`](codes::RESERVED_CODE_LIMIT) belong to
/// the framework; anything at or above it is chosen by service handlers.
pub mod codes {
    /// The request succeeded.
    pub const SUCCESS: u16 = 0;
    /// Unknown service, method, transaction or node.
    pub const NOT_EXIST: u16 = 1;
    /// Send on a disabled or disposed connection.
    pub const CLOSED: u16 = 2;
    /// No response within the response window.
    pub const TIMEOUT: u16 = 3;
    /// Gateway admission: too many connections.
    pub const TOO_MANY_CONN: u16 = 4;
    /// Gateway admission: illegal connection.
    pub const ILLEGAL_CONN: u16 = 5;
    /// Failed to serialize a message.
    pub const MARSHAL: u16 = 6;
    /// Failed to deserialize a message or frame.
    pub const UNMARSHAL: u16 = 7;
    /// Transport failure.
    pub const IO: u16 = 8;
    /// Outbound connect failure.
    pub const CONNECT: u16 = 9;
    /// Listener bind failure.
    pub const LISTEN: u16 = 10;
    /// Listener accept failure.
    pub const ACCEPT: u16 = 11;
    /// Handler panic or dispatch failure.
    pub const SERVICE: u16 = 12;
    /// The request was dropped by its handler without an answer.
    pub const NO_RESPONSE: u16 = 13;
    /// The outbound queue is above its high-watermark.
    pub const BACKPRESSURE: u16 = 14;
    /// The method key does not fit the 16-bit key space.
    pub const METHOD_OUT_OF_RANGE: u16 = 15;
    /// Invalid configuration.
    pub const CONFIG: u16 = 16;

    /// First code available to service handlers.
    pub const RESERVED_CODE_LIMIT: u16 = 100;

    /// Whether `code` belongs to the framework range.
    pub fn is_framework(code: u16) -> bool {
        code < RESERVED_CODE_LIMIT
    }
}

/// Top-level error type for the hive runtime.
#[derive(Error, Debug)]
pub enum HiveError {
    /// Unknown service/method, transaction id or node.
    #[error("Not exist: {0}")]
    NotExist(String),

    /// The connection is disabled or disposed.
    #[error("Connection closed")]
    Closed,

    /// No response arrived within the response window.
    #[error("Request {tid} timed out")]
    Timeout {
        /// The transaction that timed out.
        tid: i64,
    },

    /// Gateway admission refused: too many connections.
    #[error("Too many connections (max {max})")]
    TooManyConn {
        /// The configured limit.
        max: usize,
    },

    /// Gateway admission refused: illegal connection.
    #[error("Illegal connection: {0}")]
    IllegalConn(String),

    /// Serialization failure.
    #[error("Marshal error: {0}")]
    Marshal(String),

    /// Deserialization failure, naming the field that could not be parsed.
    #[error("Unmarshal error at `{field}`: {reason}")]
    Unmarshal {
        /// The frame field or message being parsed.
        field: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// Transport I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound connect failure.
    #[error("Connect to {addr} failed: {reason}")]
    Connect {
        /// The remote address.
        addr: String,
        /// Why the attempt failed.
        reason: String,
    },

    /// Listener bind failure.
    #[error("Listen on {addr} failed: {reason}")]
    Listen {
        /// The local address.
        addr: String,
        /// Why the bind failed.
        reason: String,
    },

    /// Listener accept failure.
    #[error("Accept failed: {0}")]
    Accept(String),

    /// Handler panic or dispatch failure.
    #[error("Service error: {0}")]
    Service(String),

    /// An explicit failure code chosen by a handler.
    #[error("Request failed with code {0}")]
    Fail(u16),

    /// The outbound queue is above its high-watermark.
    #[error("Backpressure: {pending} frames pending (max {max})")]
    Backpressure {
        /// Frames currently queued.
        pending: usize,
        /// The configured high-watermark.
        max: usize,
    },

    /// `svc * 1000 + code` does not fit the 16-bit key space.
    #[error("Method key out of range: svc={svc}, code={code}")]
    MethodOutOfRange {
        /// Service id.
        svc: u16,
        /// Method code.
        code: u8,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HiveError {
    /// Shorthand for an unmarshal error.
    pub fn unmarshal(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Unmarshal {
            field,
            reason: reason.into(),
        }
    }

    /// The wire code this error is reported with in a `ResponseFail` frame.
    pub fn code(&self) -> u16 {
        match self {
            Self::NotExist(_) => codes::NOT_EXIST,
            Self::Closed => codes::CLOSED,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::TooManyConn { .. } => codes::TOO_MANY_CONN,
            Self::IllegalConn(_) => codes::ILLEGAL_CONN,
            Self::Marshal(_) => codes::MARSHAL,
            Self::Unmarshal { .. } => codes::UNMARSHAL,
            Self::Io(_) => codes::IO,
            Self::Connect { .. } => codes::CONNECT,
            Self::Listen { .. } => codes::LISTEN,
            Self::Accept(_) => codes::ACCEPT,
            Self::Service(_) => codes::SERVICE,
            Self::Fail(code) => *code,
            Self::Backpressure { .. } => codes::BACKPRESSURE,
            Self::MethodOutOfRange { .. } => codes::METHOD_OUT_OF_RANGE,
            Self::Config(_) => codes::CONFIG,
        }
    }

    /// Whether this is a closed-connection error (the only kind send retries on).
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Alias for hive results.
pub type HiveResult<T> = Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_framework_range() {
        let errors = [
            HiveError::NotExist("svc 3".into()),
            HiveError::Closed,
            HiveError::Timeout { tid: 7 },
            HiveError::unmarshal("head", "short buffer"),
            HiveError::Service("boom".into()),
            HiveError::Backpressure { pending: 2, max: 1 },
        ];
        for err in &errors {
            assert!(codes::is_framework(err.code()), "{err} -> {}", err.code());
            assert_ne!(err.code(), codes::SUCCESS);
        }
    }

    #[test]
    fn test_fail_keeps_user_code() {
        assert_eq!(HiveError::Fail(1234).code(), 1234);
        assert!(!codes::is_framework(1234));
    }

    #[test]
    fn test_unmarshal_names_field() {
        let err = HiveError::unmarshal("tid", "need 8 bytes, have 3");
        let text = err.to_string();
        assert!(text.contains("`tid`"));
        assert!(text.contains("need 8 bytes"));
    }

    #[test]
    fn test_is_closed() {
        assert!(HiveError::Closed.is_closed());
        assert!(!HiveError::Io(std::io::Error::other("x")).is_closed());
    }
}
