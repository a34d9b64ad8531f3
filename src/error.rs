//! Unified application error model and mapping helpers.
//! Every layer that talks to a caller (HTTP API, CLI, registrar) returns `AppError`,
//! and the controller inspects the kind to decide between retry, requeue and abort.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserInput,
    /// Caller identity could not be established.
    Auth,
    /// Identity is known but the capability does not allow the operation.
    Forbidden,
    NotFound,
    Conflict,
    /// The resource exists but is still being provisioned.
    NotReady,
    Timeout,
    /// The backing-object store rejected or failed an operation.
    Provision,
    /// A reconcile pass worked on superseded data.
    StaleGeneration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UserInput => "user_input",
            ErrorKind::Auth => "auth",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Provision => "provision",
            ErrorKind::StaleGeneration => "stale_generation",
            ErrorKind::Internal => "internal",
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::UserInput => 400,
            ErrorKind::Auth => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::NotReady => 202,
            ErrorKind::Timeout => 504,
            ErrorKind::Provision => 502,
            ErrorKind::StaleGeneration => 409,
            ErrorKind::Internal => 500,
        }
    }

    /// Best-effort reverse mapping used by the CLI when the body carries no kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::UserInput,
            401 => ErrorKind::Auth,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            202 => ErrorKind::NotReady,
            408 | 504 => ErrorKind::Timeout,
            502 | 503 => ErrorKind::Provision,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip)]
    cause: Option<Arc<anyhow::Error>>,
}

impl AppError {
    pub fn new<S: Into<String>>(kind: ErrorKind, code: S, msg: S) -> Self {
        AppError { kind, code: code.into(), message: msg.into(), cause: None }
    }

    pub fn kind(&self) -> ErrorKind { self.kind }
    pub fn code_str(&self) -> &str { self.code.as_str() }
    pub fn message(&self) -> &str { self.message.as_str() }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::UserInput, code, msg) }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::Auth, code, msg) }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::Forbidden, code, msg) }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::NotFound, code, msg) }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::Conflict, code, msg) }
    pub fn not_ready<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::NotReady, code, msg) }
    pub fn timeout<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::Timeout, code, msg) }
    pub fn provision<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::Provision, code, msg) }
    pub fn stale<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::StaleGeneration, code, msg) }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { Self::new(ErrorKind::Internal, code, msg) }

    /// Attach the underlying error; it is reported through `source()`.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        self.cause = Some(Arc::new(cause.into()));
        self
    }

    pub fn cause(&self) -> Option<&anyhow::Error> { self.cause.as_deref() }

    pub fn http_status(&self) -> u16 { self.kind.http_status() }

    /// Identity or capability rejection.
    pub fn is_auth(&self) -> bool { matches!(self.kind, ErrorKind::Auth | ErrorKind::Forbidden) }

    /// Errors a client may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::NotReady | ErrorKind::Timeout | ErrorKind::Provision | ErrorKind::StaleGeneration => true,
            ErrorKind::Conflict => self.code == "signout_pending",
            _ => false,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|e| {
            let inner: &(dyn std::error::Error + 'static) = e.as_ref();
            inner
        })
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Keep an AppError that was wrapped in anyhow intact
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::internal("internal_error", "internal error").with_cause(other),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::AlreadyExists { .. } => ErrorKind::Conflict,
            StoreError::Conflict { .. } => ErrorKind::StaleGeneration,
            StoreError::Invalid { .. } => ErrorKind::Internal,
            StoreError::Rejected { .. } | StoreError::Unavailable(_) => ErrorKind::Provision,
            StoreError::Io(_) | StoreError::Serde(_) => ErrorKind::Internal,
        };
        let msg = err.to_string();
        AppError::new(kind, err.code(), msg.as_str()).with_cause(err)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
