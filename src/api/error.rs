//! Structured API error responses with error codes
//!
//! Every admin endpoint returns failures as `{"error": {...}}` with a stable
//! machine-readable code, plus an `x-error-code` header.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::As2Error;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (3xxx)
    /// Field value is invalid
    InvalidFieldValue,

    // Resource errors (4xxx)
    /// Requested resource not found
    ResourceNotFound,
    PartnerNotFound,
    MessageNotFound,
    CertificateNotFound,

    // Conflict errors (5xxx)
    /// Resource already exists
    AlreadyExists,
    /// State changed underneath the request
    ConcurrentModification,
    /// Another operation is in progress on the message
    MessageBusy,

    // Crypto errors (6xxx)
    /// Signing, encryption or key failure
    CryptoError,
    /// Algorithm outside the allow-list
    UnsupportedAlgorithm,
    CompressionError,
    MdnVerificationFailed,

    // State errors (7xxx)
    /// Invalid state transition
    InvalidStateTransition,
    /// Partner or certificate setup prevents the operation
    ConfigurationError,

    // Infrastructure errors (8xxx)
    /// Database operation failed
    DatabaseError,
    /// Partner endpoint failed
    TransportError,
    /// Operation timed out
    Timeout,
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            // Validation (3xxx)
            ErrorCode::InvalidFieldValue => 3003,

            // Resource (4xxx)
            ErrorCode::ResourceNotFound => 4001,
            ErrorCode::PartnerNotFound => 4002,
            ErrorCode::MessageNotFound => 4003,
            ErrorCode::CertificateNotFound => 4004,

            // Conflict (5xxx)
            ErrorCode::AlreadyExists => 5001,
            ErrorCode::ConcurrentModification => 5002,
            ErrorCode::MessageBusy => 5003,

            // Crypto (6xxx)
            ErrorCode::CryptoError => 6001,
            ErrorCode::UnsupportedAlgorithm => 6002,
            ErrorCode::CompressionError => 6003,
            ErrorCode::MdnVerificationFailed => 6004,

            // State (7xxx)
            ErrorCode::InvalidStateTransition => 7001,
            ErrorCode::ConfigurationError => 7002,

            // Infrastructure (8xxx)
            ErrorCode::DatabaseError => 8001,
            ErrorCode::TransportError => 8002,
            ErrorCode::Timeout => 8003,
            ErrorCode::InternalError => 8999,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidFieldValue => StatusCode::BAD_REQUEST,

            ErrorCode::ResourceNotFound
            | ErrorCode::PartnerNotFound
            | ErrorCode::MessageNotFound
            | ErrorCode::CertificateNotFound => StatusCode::NOT_FOUND,

            ErrorCode::AlreadyExists
            | ErrorCode::ConcurrentModification
            | ErrorCode::MessageBusy
            | ErrorCode::InvalidStateTransition => StatusCode::CONFLICT,

            ErrorCode::CryptoError
            | ErrorCode::UnsupportedAlgorithm
            | ErrorCode::CompressionError
            | ErrorCode::MdnVerificationFailed
            | ErrorCode::ConfigurationError => StatusCode::UNPROCESSABLE_ENTITY,

            ErrorCode::TransportError => StatusCode::BAD_GATEWAY,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code_str = match self {
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::PartnerNotFound => "PARTNER_NOT_FOUND",
            ErrorCode::MessageNotFound => "MESSAGE_NOT_FOUND",
            ErrorCode::CertificateNotFound => "CERTIFICATE_NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::ConcurrentModification => "CONCURRENT_MODIFICATION",
            ErrorCode::MessageBusy => "MESSAGE_BUSY",
            ErrorCode::CryptoError => "CRYPTO_ERROR",
            ErrorCode::UnsupportedAlgorithm => "UNSUPPORTED_ALGORITHM",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::MdnVerificationFailed => "MDN_VERIFICATION_FAILED",
            ErrorCode::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", code_str)
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Related resource ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                resource_id: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.error.code.to_string();
        let mut response = (status, Json(self)).into_response();

        if let Ok(code_value) = axum::http::HeaderValue::from_str(&code_str) {
            response.headers_mut().insert(
                axum::http::header::HeaderName::from_static("x-error-code"),
                code_value,
            );
        }

        response
    }
}

// ============================================================================
// Conversion from As2Error
// ============================================================================

impl From<As2Error> for ApiError {
    fn from(err: As2Error) -> Self {
        match err {
            As2Error::Database(e) => {
                tracing::error!(error = %e, "Database error in API handler");
                ApiError::new(ErrorCode::DatabaseError, format!("Database error: {}", e))
            }
            As2Error::Crypto(e) => ApiError::new(ErrorCode::CryptoError, e.to_string()),
            As2Error::UnsupportedAlgorithm(msg) => {
                ApiError::new(ErrorCode::UnsupportedAlgorithm, msg)
            }
            As2Error::Compression(msg) => ApiError::new(ErrorCode::CompressionError, msg),
            As2Error::Transport(e) => ApiError::new(ErrorCode::TransportError, e.to_string()),
            As2Error::Timeout(msg) => ApiError::new(ErrorCode::Timeout, msg),
            As2Error::MdnVerification(msg) => {
                ApiError::new(ErrorCode::MdnVerificationFailed, msg)
            }
            As2Error::Validation(msg) => ApiError::new(ErrorCode::InvalidFieldValue, msg),
            As2Error::Configuration(msg) => ApiError::new(ErrorCode::ConfigurationError, msg),
            As2Error::PartnerNotFound(id) => {
                ApiError::new(ErrorCode::PartnerNotFound, format!("Partner not found: {}", id))
                    .with_resource_id(id)
            }
            As2Error::MessageNotFound(id) => {
                ApiError::new(ErrorCode::MessageNotFound, format!("Message not found: {}", id))
                    .with_resource_id(id)
            }
            As2Error::CertificateNotFound(serial) => ApiError::new(
                ErrorCode::CertificateNotFound,
                format!("Certificate not found: {}", serial),
            )
            .with_resource_id(serial),
            As2Error::AlreadyExists(msg) => ApiError::new(ErrorCode::AlreadyExists, msg),
            As2Error::InvalidStateTransition {
                message_id,
                from,
                to,
            } => ApiError::new(
                ErrorCode::InvalidStateTransition,
                format!("Invalid state transition for {}: {} -> {}", message_id, from, to),
            )
            .with_resource_id(message_id)
            .with_details(serde_json::json!({
                "from_state": from,
                "to_state": to
            })),
            As2Error::ConcurrentModification {
                message_id,
                expected,
            } => ApiError::new(
                ErrorCode::ConcurrentModification,
                format!("Message {} is no longer in state {}", message_id, expected),
            )
            .with_resource_id(message_id),
            As2Error::MessageBusy(id) => ApiError::new(
                ErrorCode::MessageBusy,
                format!("Message {} is being processed, try again", id),
            )
            .with_resource_id(id),
            As2Error::Internal(msg) => ApiError::new(ErrorCode::InternalError, msg),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn not_found(resource_type: &str, id: impl std::fmt::Display) -> ApiError {
    ApiError::new(
        ErrorCode::ResourceNotFound,
        format!("{} not found: {}", resource_type, id),
    )
    .with_resource_id(id.to_string())
}

/// Create a validation error with field details
pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InvalidFieldValue, message.into())
        .with_details(serde_json::json!({ "field": field }))
}
