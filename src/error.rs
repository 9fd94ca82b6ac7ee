//! Error taxonomy shared by the relay server and the client
//!
//! Every error carries a stable machine-readable code next to its human
//! message. The retry engine and the exit-code mapping branch on the variant
//! and code, never on the message text.

use crate::protocol::{ErrorBody, ProtocolError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sub-codes of [`RelayError::Instance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceErrorCode {
    InstanceNotFound,
    AmbiguousInstance,
    InstanceReloading,
    InstanceBusy,
}

impl InstanceErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceErrorCode::InstanceNotFound => "INSTANCE_NOT_FOUND",
            InstanceErrorCode::AmbiguousInstance => "AMBIGUOUS_INSTANCE",
            InstanceErrorCode::InstanceReloading => "INSTANCE_RELOADING",
            InstanceErrorCode::InstanceBusy => "INSTANCE_BUSY",
        }
    }

    fn parse(code: &str) -> Option<Self> {
        match code {
            "INSTANCE_NOT_FOUND" => Some(InstanceErrorCode::InstanceNotFound),
            "AMBIGUOUS_INSTANCE" => Some(InstanceErrorCode::AmbiguousInstance),
            "INSTANCE_RELOADING" => Some(InstanceErrorCode::InstanceReloading),
            "INSTANCE_BUSY" => Some(InstanceErrorCode::InstanceBusy),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-codes of [`RelayError::Timeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutCode {
    /// A single attempt got no response in time
    Timeout,
    /// The retry budget ran out
    RetryTimeout,
}

impl TimeoutCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutCode::Timeout => "TIMEOUT",
            TimeoutCode::RetryTimeout => "RETRY_TIMEOUT",
        }
    }
}

impl fmt::Display for TimeoutCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";

/// Errors surfaced by relay operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The relay server cannot be reached at all
    #[error("[CONNECTION_ERROR] {message}")]
    Connection { message: String },

    /// A frame or envelope was malformed
    #[error("[PROTOCOL_ERROR] {message}")]
    Protocol { message: String },

    /// The target instance is missing, ambiguous or unavailable
    #[error("[{code}] {message}")]
    Instance {
        code: InstanceErrorCode,
        message: String,
    },

    /// No response arrived in time
    #[error("[{code}] {message}")]
    Timeout { code: TimeoutCode, message: String },

    /// The instance executed the command and reported a failure of its own
    #[error("[{code}] {message}")]
    Command { code: String, message: String },
}

impl RelayError {
    pub fn connection(message: impl Into<String>) -> Self {
        RelayError::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RelayError::Protocol {
            message: message.into(),
        }
    }

    pub fn instance(code: InstanceErrorCode, message: impl Into<String>) -> Self {
        RelayError::Instance {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::instance(InstanceErrorCode::InstanceNotFound, message)
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::instance(InstanceErrorCode::AmbiguousInstance, message)
    }

    pub fn reloading(message: impl Into<String>) -> Self {
        Self::instance(InstanceErrorCode::InstanceReloading, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::instance(InstanceErrorCode::InstanceBusy, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        RelayError::Timeout {
            code: TimeoutCode::Timeout,
            message: message.into(),
        }
    }

    pub fn retry_timeout(message: impl Into<String>) -> Self {
        RelayError::Timeout {
            code: TimeoutCode::RetryTimeout,
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &str {
        match self {
            RelayError::Connection { .. } => CONNECTION_ERROR,
            RelayError::Protocol { .. } => PROTOCOL_ERROR,
            RelayError::Instance { code, .. } => code.as_str(),
            RelayError::Timeout { code, .. } => code.as_str(),
            RelayError::Command { code, .. } => code,
        }
    }

    /// Human-readable message without the code prefix
    pub fn message(&self) -> &str {
        match self {
            RelayError::Connection { message }
            | RelayError::Protocol { message }
            | RelayError::Instance { message, .. }
            | RelayError::Timeout { message, .. }
            | RelayError::Command { message, .. } => message,
        }
    }

    /// Whether the retry engine should recover from this error on its own
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Instance { code, .. } => matches!(
                code,
                InstanceErrorCode::InstanceReloading | InstanceErrorCode::InstanceBusy
            ),
            RelayError::Timeout { .. } => true,
            RelayError::Connection { .. }
            | RelayError::Protocol { .. }
            | RelayError::Command { .. } => false,
        }
    }

    /// Process exit code a CLI should report for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RelayError::Connection { .. } => ExitCode::ConnectionError,
            RelayError::Timeout { .. } => ExitCode::TransientError,
            RelayError::Instance { .. } if self.is_retryable() => ExitCode::TransientError,
            RelayError::Instance { .. } | RelayError::Protocol { .. } | RelayError::Command { .. } => {
                ExitCode::OperationError
            }
        }
    }

    /// Wire representation for a RESPONSE error field
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.message().to_string(),
        }
    }

    /// Rebuild a typed error from a RESPONSE error field
    ///
    /// Codes outside the relay taxonomy are failures reported by the command
    /// itself and map to [`RelayError::Command`].
    pub fn from_body(body: ErrorBody) -> Self {
        let ErrorBody { code, message } = body;
        if let Some(instance_code) = InstanceErrorCode::parse(&code) {
            return RelayError::instance(instance_code, message);
        }
        match code.as_str() {
            CONNECTION_ERROR => RelayError::Connection { message },
            PROTOCOL_ERROR => RelayError::Protocol { message },
            "TIMEOUT" => RelayError::timeout(message),
            "RETRY_TIMEOUT" => RelayError::retry_timeout(message),
            _ => RelayError::Command { code, message },
        }
    }
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => RelayError::connection(e.to_string()),
            ProtocolError::ConnectionClosed => {
                RelayError::connection("connection closed by relay server")
            }
            other => RelayError::protocol(other.to_string()),
        }
    }
}

/// Process exit codes reported by the CLI
///
/// One closed enumeration; `TestFailure` is reserved for commands that ran
/// but reported failures of their own (e.g. a failing test run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    UsageError = 1,
    TransientError = 2,
    ConnectionError = 3,
    OperationError = 4,
    TestFailure = 5,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RelayError::reloading("r").is_retryable());
        assert!(RelayError::busy("b").is_retryable());
        assert!(RelayError::timeout("t").is_retryable());
        assert!(RelayError::retry_timeout("t").is_retryable());

        assert!(!RelayError::not_found("n").is_retryable());
        assert!(!RelayError::ambiguous("a").is_retryable());
        assert!(!RelayError::protocol("p").is_retryable());
        assert!(!RelayError::connection("c").is_retryable());
    }

    #[test]
    fn test_exit_code_mapping() {
        let cases = [
            (RelayError::connection("refused"), ExitCode::ConnectionError),
            (RelayError::timeout("slow"), ExitCode::TransientError),
            (RelayError::retry_timeout("gave up"), ExitCode::TransientError),
            (RelayError::reloading("reloading"), ExitCode::TransientError),
            (RelayError::busy("busy"), ExitCode::TransientError),
            (RelayError::not_found("missing"), ExitCode::OperationError),
            (RelayError::ambiguous("two"), ExitCode::OperationError),
            (RelayError::protocol("bad frame"), ExitCode::OperationError),
            (
                RelayError::Command {
                    code: "INVALID_PARAMS".into(),
                    message: "bad".into(),
                },
                ExitCode::OperationError,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.exit_code(), expected, "{}", err);
        }
        assert_eq!(ExitCode::OperationError.code(), 4);
        assert_eq!(ExitCode::TestFailure.code(), 5);
    }

    #[test]
    fn test_body_mapping_keeps_codes() {
        let err = RelayError::from_body(ErrorBody {
            code: "INSTANCE_RELOADING".into(),
            message: "domain reload".into(),
        });
        assert_eq!(err, RelayError::reloading("domain reload"));
        assert_eq!(err.to_body().code, "INSTANCE_RELOADING");

        let custom = RelayError::from_body(ErrorBody {
            code: "GAMEOBJECT_NOT_FOUND".into(),
            message: "no Player".into(),
        });
        assert_eq!(custom.code(), "GAMEOBJECT_NOT_FOUND");
        assert!(!custom.is_retryable());
    }

    #[test]
    fn test_display_includes_code() {
        let err = RelayError::ambiguous("2 instances match 'Game'");
        assert_eq!(err.to_string(), "[AMBIGUOUS_INSTANCE] 2 instances match 'Game'");
    }
}
