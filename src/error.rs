//! Error types for memcore operations.

use thiserror::Error;

use crate::frame::PhysAddr;

/// Result type alias using [`MemError`].
pub type Result<T> = std::result::Result<T, MemError>;

/// Error types for memcore operations.
///
/// Only recoverable conditions are represented here. Caller contract
/// violations that leave shared state unsound (pool exhaustion, freeing a
/// misaligned frame) are fatal and panic instead.
#[derive(Debug, Error)]
pub enum MemError {
    /// Frame address outside the managed physical range.
    ///
    /// This is a soft boundary rejection: the operation reports the error
    /// and leaves allocator state untouched.
    #[error("frame address {addr:#x} outside managed range [{base:#x}, {limit:#x})")]
    FrameOutOfRange { addr: u64, base: u64, limit: u64 },

    /// Content access or share of a frame that is currently free.
    #[error("frame {0} is not allocated")]
    FrameNotAllocated(PhysAddr),

    /// Invalid construction parameters (zero shard count, empty range, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Block device I/O failure, propagated from the device collaborator.
    #[error("block device error: {0}")]
    Device(String),
}
