use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VosError>;

/// Error kinds surfaced by the storage engine core.
///
/// Variants map one-to-one onto the semantic error kinds of the
/// specification: the engine never invents a new kind mid-call, it
/// widens an existing one.
#[derive(Debug, Error)]
pub enum VosError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Exists(&'static str),
    #[error("out of memory: {0}")]
    NoMemory(String),
    #[error("no space left: {0}")]
    NoSpace(String),
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("operation timed out: {0}")]
    TimedOut(String),
    #[error("incompatible agent/version: {0}")]
    AgentIncompatible(String),
    #[error("HLC clock skew exceeds epsilon: {0}")]
    HlcSync(String),
    /// Not a hard failure: the contract signalling the caller to retry
    /// with a fresh epoch. Never logged at `error` level.
    #[error("transaction must restart: {0}")]
    TxRestart(String),
    #[error("transaction busy: {0}")]
    TxBusy(String),
    #[error("operation already in progress: {0}")]
    InProgress(String),
    #[error("permission denied: {0}")]
    NoPermission(String),
    #[error("numeric overflow: {0}")]
    Overflow(String),
    #[error("truncated data: {0}")]
    Truncated(String),
    #[error("invalid handle: {0}")]
    NoHandle(String),
    #[error("no such system resource: {0}")]
    NoSystem(String),
    #[error("deprecated interface: {0}")]
    Deprecated(&'static str),
}

impl VosError {
    /// True for the restart contract (§7): callers retry, this is never a
    /// logged failure.
    pub fn is_restart(&self) -> bool {
        matches!(self, VosError::TxRestart(_))
    }
}

/// Acquires a mutex, converting poison into a corruption error instead of
/// panicking. Every shared in-process structure (GC bins, DTX cache) goes
/// through this so a panicking ULT cannot wedge the whole engine silently.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        tracing::error!("engine mutex poisoned - fatal error");
        VosError::Corruption("engine mutex poisoned - fatal error".into())
    })
}
