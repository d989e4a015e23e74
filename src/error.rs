//! Stable error codes shared across transports.
//!
//! Every subsystem reports domain failures with one of these codes. The HTTP
//! layer maps them to 4xx responses; MCP tool handlers embed them in
//! `isError` payloads. Unexpected errors become `INTERNAL_ERROR` and the
//! message is suppressed in production.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Transport-stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    BoundaryViolation,
    Locked,
    SessionLimit,
    // Relay
    InvalidSubject,
    AccessDenied,
    EndpointNotFound,
    PublishFailed,
    InboxReadFailed,
    RegistrationFailed,
    // Adapters / bindings
    BindingCreateFailed,
    EnableFailed,
    DisableFailed,
    ReloadFailed,
    // Mesh
    MeshDisabled,
    DiscoverFailed,
    RegisterFailed,
    DenyFailed,
    UnregisterFailed,
    // Subsystem gates
    RelayDisabled,
    TracingDisabled,
    BindingsDisabled,
    AdaptersDisabled,
    PulseDisabled,
    // Generic
    NotFound,
    Timeout,
    Cancelled,
    InternalError,
}

impl ErrorCode {
    /// HTTP status this code maps to. Domain errors are 4xx; only
    /// `INTERNAL_ERROR` is a 500.
    pub fn http_status(self) -> u16 {
        match self {
            Self::ValidationFailed
            | Self::BoundaryViolation
            | Self::InvalidSubject
            | Self::PublishFailed
            | Self::InboxReadFailed
            | Self::RegistrationFailed
            | Self::BindingCreateFailed
            | Self::EnableFailed
            | Self::DisableFailed
            | Self::ReloadFailed
            | Self::DiscoverFailed
            | Self::RegisterFailed
            | Self::DenyFailed
            | Self::UnregisterFailed
            | Self::Cancelled => 400,
            Self::AccessDenied
            | Self::MeshDisabled
            | Self::RelayDisabled
            | Self::TracingDisabled
            | Self::BindingsDisabled
            | Self::AdaptersDisabled
            | Self::PulseDisabled => 403,
            Self::NotFound | Self::EndpointNotFound => 404,
            Self::Timeout => 408,
            Self::Locked => 409,
            Self::SessionLimit => 429,
            Self::InternalError => 500,
        }
    }

    /// The wire string, e.g. `BOUNDARY_VIOLATION`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::BoundaryViolation => "BOUNDARY_VIOLATION",
            Self::Locked => "LOCKED",
            Self::SessionLimit => "SESSION_LIMIT",
            Self::InvalidSubject => "INVALID_SUBJECT",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::EndpointNotFound => "ENDPOINT_NOT_FOUND",
            Self::PublishFailed => "PUBLISH_FAILED",
            Self::InboxReadFailed => "INBOX_READ_FAILED",
            Self::RegistrationFailed => "REGISTRATION_FAILED",
            Self::BindingCreateFailed => "BINDING_CREATE_FAILED",
            Self::EnableFailed => "ENABLE_FAILED",
            Self::DisableFailed => "DISABLE_FAILED",
            Self::ReloadFailed => "RELOAD_FAILED",
            Self::MeshDisabled => "MESH_DISABLED",
            Self::DiscoverFailed => "DISCOVER_FAILED",
            Self::RegisterFailed => "REGISTER_FAILED",
            Self::DenyFailed => "DENY_FAILED",
            Self::UnregisterFailed => "UNREGISTER_FAILED",
            Self::RelayDisabled => "RELAY_DISABLED",
            Self::TracingDisabled => "TRACING_DISABLED",
            Self::BindingsDisabled => "BINDINGS_DISABLED",
            Self::AdaptersDisabled => "ADAPTERS_DISABLED",
            Self::PulseDisabled => "PULSE_DISABLED",
            Self::NotFound => "NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain error carrying a stable code, a human message, and optional
/// structured details (field-level validation errors, lock holder info).
#[derive(Debug, Clone, Serialize)]
pub struct DomainError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl DomainError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DomainError {}

pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::BoundaryViolation).unwrap();
        assert_eq!(json, "\"BOUNDARY_VIOLATION\"");
        assert_eq!(ErrorCode::BoundaryViolation.as_str(), "BOUNDARY_VIOLATION");
    }

    #[test]
    fn domain_errors_are_4xx_internal_is_500() {
        assert_eq!(ErrorCode::Locked.http_status(), 409);
        assert_eq!(ErrorCode::SessionLimit.http_status(), 429);
        assert_eq!(ErrorCode::EndpointNotFound.http_status(), 404);
        assert_eq!(ErrorCode::InvalidSubject.http_status(), 400);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
    }
}
