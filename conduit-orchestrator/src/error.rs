//! Error types
//!
//! `StoreError` is what persistence returns; `ServiceError` is the uniform
//! result every service resolves to, carrying a message and a machine
//! readable reason that the API layer maps to an HTTP status.

use conduit_core::TransitionError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Persistence error
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Optimistic lock failure: the row changed since it was read
    #[error("{entity} {id} was modified concurrently")]
    StaleObject { entity: &'static str, id: i64 },

    /// Unique constraint or similar integrity violation
    #[error("{0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleObject { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Machine readable reason of a failed service call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Forbidden,
    NotFound,
    BadRequest,
    Unauthorized,
    UnprocessableEntity,
    Conflict,
    RangeNotSatisfiable,
    TooManyRequests,
    ServiceUnavailable,
    Internal,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Forbidden => "forbidden",
            Reason::NotFound => "not_found",
            Reason::BadRequest => "bad_request",
            Reason::Unauthorized => "unauthorized",
            Reason::UnprocessableEntity => "unprocessable_entity",
            Reason::Conflict => "conflict",
            Reason::RangeNotSatisfiable => "range_not_satisfiable",
            Reason::TooManyRequests => "too_many_requests",
            Reason::ServiceUnavailable => "service_unavailable",
            Reason::Internal => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Reason::BadRequest => 400,
            Reason::Unauthorized => 401,
            Reason::Forbidden => 403,
            Reason::NotFound => 404,
            Reason::Conflict => 409,
            Reason::RangeNotSatisfiable => 416,
            Reason::UnprocessableEntity => 422,
            Reason::TooManyRequests => 429,
            Reason::Internal => 500,
            Reason::ServiceUnavailable => 503,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error response of a service call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub reason: Reason,
    pub message: String,
}

impl ServiceError {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Reason::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Reason::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Reason::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Reason::Unauthorized, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(Reason::UnprocessableEntity, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Reason::Conflict, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(Reason::TooManyRequests, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Reason::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Reason::Internal, message)
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ServiceError::not_found(err.to_string()),
            StoreError::StaleObject { .. } | StoreError::Conflict(_) => {
                ServiceError::conflict(err.to_string())
            }
            StoreError::Database(_) | StoreError::Serialization(_) => {
                tracing::error!("Store error: {:?}", err);
                ServiceError::internal("Internal server error")
            }
        }
    }
}

impl From<TransitionError> for ServiceError {
    fn from(err: TransitionError) -> Self {
        ServiceError::unprocessable(err.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
