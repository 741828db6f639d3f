//! Crate-wide error taxonomy.
//!
//! Every component returns `Result<T, ExecError>` (or a store-level error
//! that gets wrapped into `ExecError::Store` at the component boundary).
//! Variants mirror the error kinds named in the design's error-handling
//! section; not retryable unless noted on the variant.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// A single risk-limit violation kind. Currently position size is the only
/// aggregate limit enforced; exposure/daily-loss limits are stored but not
/// yet evaluated (see DESIGN.md open items).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationType {
    MaxPositionSize,
}

/// Top-level error type for the execution core.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::domain::OrderStatus,
        to: crate::domain::OrderStatus,
    },

    #[error("order {order_id} is not in a fillable state (status={status:?})")]
    InvalidStateForFill {
        order_id: uuid::Uuid,
        status: crate::domain::OrderStatus,
    },

    #[error("fill of {fill_qty} would exceed order {order_id}'s remaining quantity")]
    FillExceedsOrder {
        order_id: uuid::Uuid,
        fill_qty: Decimal,
    },

    #[error("optimistic lock failed for position {user_id}/{symbol}: expected version {expected}, found {found}")]
    OptimisticLockFailed {
        user_id: uuid::Uuid,
        symbol: String,
        expected: i64,
        found: i64,
    },

    #[error("risk limit exceeded: {violation_type:?}")]
    RiskLimitExceeded { violation_type: ViolationType },

    #[error("no risk limits configured for user {user_id} symbol {symbol}")]
    NoLimitsConfigured { user_id: uuid::Uuid, symbol: String },

    #[error("position version changed since the request was issued (expected {expected}, found {found})")]
    PositionChanged { expected: i64, found: i64 },

    #[error("kill switch active (reason={reason}, since={activated_at})")]
    KillSwitchActive {
        reason: String,
        activated_at: DateTime<Utc>,
    },

    #[error("rate limiter queue is full (max_queue_size={max_queue_size})")]
    RateLimitQueueFull { max_queue_size: usize },

    #[error("rate limiter wait exceeded deadline ({waited_ms}ms)")]
    RateLimitQueueTimeout { waited_ms: u64 },

    #[error("rate limiter was shut down")]
    RateLimiterStopped,

    #[error("circuit open: exchange unavailable")]
    ExchangeUnavailable,

    #[error("exchange call timed out")]
    ExchangeTimeout,

    #[error("exchange API error {code}: {message}")]
    ExchangeApiError { code: String, message: String },

    #[error("stream disconnected (recovering)")]
    StreamDisconnected,

    #[error("durable store error: {0}")]
    Store(#[from] StoreError),

    #[error("kill-switch registry error: {0}")]
    KillSwitchRegistry(String),
}

impl ExecError {
    /// Whether a caller may retry this error a bounded number of times
    /// with jitter, per the design's failure-semantics rule.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::Store(StoreError::Busy) | ExecError::OptimisticLockFailed { .. }
        )
    }

    /// User-facing `{code, message, details}` triple.
    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            code: self.code(),
            message: self.to_string(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ExecError::ValidationError(_) => "VALIDATION_ERROR",
            ExecError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ExecError::InvalidStateForFill { .. } => "INVALID_STATE_FOR_FILL",
            ExecError::FillExceedsOrder { .. } => "FILL_EXCEEDS_ORDER",
            ExecError::OptimisticLockFailed { .. } => "OPTIMISTIC_LOCK_FAILED",
            ExecError::RiskLimitExceeded { .. } => "RISK_LIMIT_EXCEEDED",
            ExecError::NoLimitsConfigured { .. } => "NO_LIMITS_CONFIGURED",
            ExecError::PositionChanged { .. } => "POSITION_CHANGED",
            ExecError::KillSwitchActive { .. } => "KILL_SWITCH_ACTIVE",
            ExecError::RateLimitQueueFull { .. } => "RATE_LIMIT_QUEUE_FULL",
            ExecError::RateLimitQueueTimeout { .. } => "RATE_LIMIT_QUEUE_TIMEOUT",
            ExecError::RateLimiterStopped => "RATE_LIMITER_STOPPED",
            ExecError::ExchangeUnavailable => "EXCHANGE_UNAVAILABLE",
            ExecError::ExchangeTimeout => "EXCHANGE_TIMEOUT",
            ExecError::ExchangeApiError { .. } => "EXCHANGE_API_ERROR",
            ExecError::StreamDisconnected => "STREAM_DISCONNECTED",
            ExecError::Store(_) => "STORE_ERROR",
            ExecError::KillSwitchRegistry(_) => "KILL_SWITCH_REGISTRY_ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

/// Errors surfaced by the durable store, independent of the backing engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {constraint}")]
    UniqueViolation { constraint: &'static str },

    #[error("row not found")]
    NotFound,

    #[error("store busy, retry")]
    Busy,

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::UniqueViolation {
                    constraint: "unique",
                }
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StoreError::Busy
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Backend(other.to_string()),
        }
    }
}
