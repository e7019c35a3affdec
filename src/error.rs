//! Error types for buffer allocation and frame notification

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BufferError>;

/// Errors raised by buffer pools and the frame buffer manager
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("invalid frame geometry: byte size {byte_size}")]
    InvalidGeometry { byte_size: usize },

    #[error("invalid number of buffers: requested {requested}, allowed 1..={max}")]
    InvalidCount { requested: usize, max: usize },

    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("buffer index {index} out of range (pool holds {len} buffers)")]
    OutOfRange { index: u64, len: usize },

    #[error("system memory query failed: {0}")]
    MemoryQuery(#[source] io::Error),

    #[error("too much memory to be described with the given frame size")]
    BudgetOverflow,

    #[error("failed to allocate buffer #{index} ({size} bytes)")]
    AllocationFailed { index: usize, size: usize },
}

/// Coarse classification of [`BufferError`], for callers that only need to
/// decide how to report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidGeometry,
    InvalidCount,
    InvalidValue,
    OutOfRange,
    Error,
}

impl BufferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BufferError::InvalidGeometry { .. } => ErrorKind::InvalidGeometry,
            BufferError::InvalidCount { .. } => ErrorKind::InvalidCount,
            BufferError::InvalidValue(_) => ErrorKind::InvalidValue,
            BufferError::OutOfRange { .. } => ErrorKind::OutOfRange,
            BufferError::MemoryQuery(_)
            | BufferError::BudgetOverflow
            | BufferError::AllocationFailed { .. } => ErrorKind::Error,
        }
    }
}
