//! Error taxonomy.
//!
//! "Not my route" is not an error: it is [`Outcome::NotHandled`](crate::Outcome).
//! Per-request failures are [`DispatchError`]s carried by
//! [`Outcome::Failed`](crate::Outcome) and mapped to responses at the transport
//! edge. Everything else here is about the process lifecycle: acquiring and
//! releasing resources, binding, draining.

use std::fmt;
use std::net::AddrParseError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::effect::BoxError;

type SharedSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

// ── Per-request failures ──────────────────────────────────────────────────────

/// Principal extraction failed.
#[derive(Clone, Debug, Error)]
#[error("{reason}")]
pub struct AuthError {
    reason: String,
}

impl AuthError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn missing_credentials() -> Self {
        Self::new("missing credentials")
    }

    pub fn invalid_credentials() -> Self {
        Self::new("invalid credentials")
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A handler found the request but could not serve it.
///
/// Cloning shares the underlying source.
#[derive(Clone, Debug)]
pub struct HandlerError {
    message: String,
    source: Option<SharedSource>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { message: message.into(), source: Some(Arc::new(source)) }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::new(format!("handler timed out after {after:?}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {source}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Payload of [`Outcome::Failed`](crate::Outcome).
#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

// ── Lifecycle failures ────────────────────────────────────────────────────────

/// A declared resource could not be constructed. Fatal during startup.
#[derive(Debug, Error)]
#[error("failed to acquire resource `{name}`: {source}")]
pub struct AcquisitionError {
    pub name: String,
    #[source]
    pub source: BoxError,
}

/// One resource whose release failed or panicked.
#[derive(Debug, Error)]
#[error("failed to release resource `{name}`: {source}")]
pub struct ReleaseError {
    pub name: String,
    #[source]
    pub source: BoxError,
}

/// Every release failure from one `release_all` pass, in release order.
#[derive(Debug, Error)]
pub struct ReleaseErrors(pub Vec<ReleaseError>);

impl fmt::Display for ReleaseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed to release", self.0.len())?;
        for e in &self.0 {
            write!(f, "; {e}")?;
        }
        Ok(())
    }
}

/// In-flight work outlived the drain window and was abandoned.
///
/// Non-fatal: logged and reported, release proceeds anyway.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("drain timed out after {timeout:?} with {abandoned} request(s) in flight")]
pub struct DrainTimeout {
    pub timeout: Duration,
    pub abandoned: usize,
}

/// The error type returned by tessera's fallible lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid socket address `{addr}`: {source}")]
    Address {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("logging: {0}")]
    Logging(String),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Release(#[from] ReleaseErrors),
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// A build step outside tessera failed (e.g. handler construction).
    #[error("startup: {0}")]
    Startup(BoxError),
}
