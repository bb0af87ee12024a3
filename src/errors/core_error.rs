use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

/// Closed error taxonomy of the core. Every fallible operation in the crate
/// resolves to one of these kinds; transports and adapters must not invent
/// new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    // Transport
    Connect,
    AuthFailure,
    SessionClosed,
    SessionUnavailable,
    SessionBusy,
    CommandDeadlineExceeded,
    // Generation
    ModelTimeout,
    ModelRefusal,
    ParseFailure,
    ValidationFailure,
    // Orchestration
    OutOfOrder,
    InvalidTransition,
    NotFound,
    // Crypto
    CredentialIntegrity,
    // Wiring / invariants
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreError {
    pub kind: CoreErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
            retryable: matches!(
                kind,
                CoreErrorKind::ModelTimeout | CoreErrorKind::CommandDeadlineExceeded
            ),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Connect, "CONNECT_ERROR", message)
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::AuthFailure, "AUTH_FAILURE", message)
    }

    pub fn session_closed(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::SessionClosed, "SESSION_CLOSED", message)
    }

    pub fn session_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            CoreErrorKind::SessionUnavailable,
            "SESSION_UNAVAILABLE",
            message,
        )
    }

    pub fn session_busy(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::SessionBusy, "SESSION_BUSY", message)
    }

    pub fn command_deadline(message: impl Into<String>) -> Self {
        Self::new(
            CoreErrorKind::CommandDeadlineExceeded,
            "COMMAND_DEADLINE_EXCEEDED",
            message,
        )
    }

    pub fn model_timeout(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ModelTimeout, "MODEL_TIMEOUT", message)
    }

    pub fn model_refusal(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ModelRefusal, "MODEL_REFUSAL", message)
    }

    pub fn parse_failure(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ParseFailure, "PARSE_FAILURE", message)
    }

    pub fn validation_failure(message: impl Into<String>) -> Self {
        Self::new(
            CoreErrorKind::ValidationFailure,
            "VALIDATION_FAILURE",
            message,
        )
    }

    pub fn out_of_order(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::OutOfOrder, "OUT_OF_ORDER", message)
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::new(
            CoreErrorKind::InvalidTransition,
            "INVALID_TRANSITION",
            message,
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn credential_integrity(message: impl Into<String>) -> Self {
        Self::new(
            CoreErrorKind::CredentialIntegrity,
            "CREDENTIAL_INTEGRITY",
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Internal, "INTERNAL", message)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::internal(err.to_string())
    }
}
