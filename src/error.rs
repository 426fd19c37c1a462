//! Error taxonomy surfaced by the User Gateway core.

use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Every error kind the core can surface to a caller or to itself during retry.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),
    #[error("stale: {0}")]
    Stale(String),
    #[error("try again: {0}")]
    TryAgain(String),
    #[error("operation already in progress: {0}")]
    InProgress(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no memory")]
    NoMemory,
    #[error("local I/O error: {0}")]
    LocalIo(#[from] io::Error),
    #[error("remote I/O error: {0}")]
    RemoteIo(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("bad message: {0}")]
    BadMessage(String),
}

impl GatewayError {
    /// Remote-I/O and timeout are retried by the issuing component; this
    /// reports whether a given error belongs to that retryable class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::RemoteIo(_) | GatewayError::Timeout(_))
    }
}

/// Maps an HTTP status code to the gateway's wire error taxonomy:
/// 4xx is a protocol failure (no retry), 5xx is remote-I/O (retry via next gateway).
pub fn from_http_status(status: u16, context: impl Into<String>) -> GatewayError {
    let context = context.into();
    if (400..500).contains(&status) {
        GatewayError::Protocol(format!("HTTP {status}: {context}"))
    } else {
        GatewayError::RemoteIo(format!("HTTP {status}: {context}"))
    }
}

pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("gateway mutex poisoned - fatal error");
        GatewayError::LocalIo(io::Error::other("poisoned lock"))
    })
}
