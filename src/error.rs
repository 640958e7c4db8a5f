use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::amount::Stroops;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient funding on policy {policy_id}: required {required}, available {available}")]
    InsufficientFunding {
        policy_id: Uuid,
        required: Stroops,
        available: Stroops,
    },

    #[error("Settlement rejected for policy {policy_id} (ref {reference}): {message}")]
    HardSettlement {
        policy_id: Uuid,
        reference: String,
        message: String,
    },

    #[error("Settlement capability unavailable for policy {policy_id} (ref {reference}): {message}")]
    SoftSettlement {
        policy_id: Uuid,
        reference: String,
        message: String,
    },

    #[error("Settlement outcome unknown for policy {policy_id} (ref {reference}): {message}")]
    SettlementUnknown {
        policy_id: Uuid,
        reference: String,
        message: String,
    },

    #[error("Ledger read failed for owner {owner_id} ({address}): {message}")]
    LedgerRead {
        owner_id: Uuid,
        address: String,
        message: String,
    },

    #[error("Coverage exceeded on policy {policy_id}: committed {committed} + requested {requested} > limit {limit}")]
    CoverageExceeded {
        policy_id: Uuid,
        limit: Stroops,
        committed: Stroops,
        requested: Stroops,
    },

    #[error("COMPENSATION FAILED for claim {claim_id} (ref {reference}): {message}")]
    CompensationFailure {
        claim_id: Uuid,
        reference: String,
        message: String,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classified failure of a call into the settlement chain.
///
/// The HTTP ledger adapter is the only place that turns raw error text into one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// The chain definitively rejected the operation.
    #[error("rejected: {0}")]
    Hard(String),

    /// The entry point does not exist on the contract. Nothing moved.
    #[error("unsupported: {0}")]
    Soft(String),

    /// The call was accepted but its result could not be read; funds may have moved.
    #[error("outcome unknown: {0}")]
    Ambiguous(String),

    #[error("timed out")]
    Timeout,
}

impl SettlementError {
    pub fn is_soft(&self) -> bool {
        matches!(self, SettlementError::Soft(_))
    }

    /// Lift into an [`AppError`] with enough context to re-trigger reconciliation.
    /// Timeouts surface as hard failures so they are retried, never absorbed.
    pub fn into_app_error(self, policy_id: Uuid, reference: &str) -> AppError {
        match self {
            SettlementError::Soft(message) => AppError::SoftSettlement {
                policy_id,
                reference: reference.to_string(),
                message,
            },
            SettlementError::Ambiguous(message) => AppError::SettlementUnknown {
                policy_id,
                reference: reference.to_string(),
                message,
            },
            SettlementError::Hard(message) => AppError::HardSettlement {
                policy_id,
                reference: reference.to_string(),
                message,
            },
            SettlementError::Timeout => AppError::HardSettlement {
                policy_id,
                reference: reference.to_string(),
                message: "settlement call timed out".to_string(),
            },
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_code, details) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", None),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            AppError::InsufficientFunding {
                policy_id,
                required,
                available,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_FUNDING",
                Some(serde_json::json!({
                    "policy_id": policy_id,
                    "required": required,
                    "available": available,
                })),
            ),
            AppError::HardSettlement {
                policy_id,
                reference,
                ..
            } => (
                StatusCode::BAD_GATEWAY,
                "SETTLEMENT_REJECTED",
                Some(serde_json::json!({"policy_id": policy_id, "reference": reference})),
            ),
            AppError::SoftSettlement {
                policy_id,
                reference,
                ..
            } => (
                StatusCode::BAD_GATEWAY,
                "SETTLEMENT_UNAVAILABLE",
                Some(serde_json::json!({"policy_id": policy_id, "reference": reference})),
            ),
            AppError::SettlementUnknown {
                policy_id,
                reference,
                ..
            } => (
                StatusCode::BAD_GATEWAY,
                "SETTLEMENT_UNKNOWN",
                Some(serde_json::json!({"policy_id": policy_id, "reference": reference})),
            ),
            AppError::LedgerRead { owner_id, address, .. } => (
                StatusCode::BAD_GATEWAY,
                "LEDGER_READ_FAILED",
                Some(serde_json::json!({"owner_id": owner_id, "address": address})),
            ),
            AppError::CoverageExceeded {
                policy_id,
                limit,
                committed,
                requested,
            } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "COVERAGE_EXCEEDED",
                Some(serde_json::json!({
                    "policy_id": policy_id,
                    "limit": limit,
                    "committed": committed,
                    "requested": requested,
                })),
            ),
            AppError::CompensationFailure {
                claim_id,
                reference,
                ..
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMPENSATION_FAILURE",
                Some(serde_json::json!({"claim_id": claim_id, "reference": reference})),
            ),
            AppError::InvalidTransition { from, to } => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                Some(serde_json::json!({"from": from, "to": to})),
            ),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", None),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", None),
            AppError::Config(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };

        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR if error_code != "COMPENSATION_FAILURE" => {
                "An internal error occurred".to_string()
            }
            _ => message,
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(error: validator::ValidationErrors) -> Self {
        AppError::Validation(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
