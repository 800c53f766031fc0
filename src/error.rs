//! Reconciliation error taxonomy and JSON error bodies for administrative callers

use serde::Serialize;

/// Invalid record or middleware data; never reaches the network
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct CompileError {
    pub reason: String,
}

impl CompileError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the reconciliation engine and the live config client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("remote server rejected {operation}: {message}")]
    RemoteConfig {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    #[error("remote server unreachable during {operation} after {attempts} attempts: {message}")]
    TransientNetwork {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("store transaction failed: {0}")]
    StoreTransaction(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ReconcileError {
    /// Wrap a persistence failure, keeping the full context chain
    pub fn store(err: anyhow::Error) -> Self {
        Self::StoreTransaction(format!("{:#}", err))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Compile(_) => ErrorCode::CompileError,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::RemoteConfig { .. } => ErrorCode::RemoteConfigError,
            Self::TransientNetwork { .. } => ErrorCode::TransientNetworkError,
            Self::StoreTransaction(_) => ErrorCode::StoreTransactionError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
        }
    }

    /// Rejected before any remote call was made
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            Self::Compile(_) | Self::Conflict(_) | Self::InvalidInput(_) | Self::NotFound(_)
        )
    }
}

/// Error codes reported to administrative callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CompileError,
    Conflict,
    RemoteConfigError,
    TransientNetworkError,
    StoreTransactionError,
    NotFound,
    InvalidInput,
}

impl ErrorCode {
    /// HTTP status an admin surface should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::CompileError => 422,
            ErrorCode::Conflict => 409,
            ErrorCode::RemoteConfigError => 502,
            ErrorCode::TransientNetworkError => 503,
            ErrorCode::StoreTransactionError => 500,
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidInput => 400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CompileError => "COMPILE_ERROR",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RemoteConfigError => "REMOTE_CONFIG_ERROR",
            ErrorCode::TransientNetworkError => "TRANSIENT_NETWORK_ERROR",
            ErrorCode::StoreTransactionError => "STORE_TRANSACTION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidInput => "INVALID_INPUT",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

impl From<&ReconcileError> for ErrorResponse {
    fn from(err: &ReconcileError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}
