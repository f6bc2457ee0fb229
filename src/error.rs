//! Error handling utils.
//!
//! Recoverable failures (a rejected submission, an invalid attribute, a
//! failed allocation) surface as [`Error`] through the crate-wide
//! [`Result`] alias. Contract violations — resuming a fiber that is not
//! ready, stopping a scheduler from the wrong thread, starting one twice —
//! are programming errors and abort via `assert!` instead.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A task was submitted to a scheduler that has already begun
    /// shutting down. The task is dropped.
    #[error("scheduler `{name}` is stopping, task rejected")]
    Stopped { name: String },

    /// The stack buffer for a fiber could not be allocated.
    #[error("failed to allocate a {size} byte fiber stack")]
    StackAlloc { size: usize },

    /// The requested per-fiber stack size is below the supported minimum.
    #[error("stack size {size} is below the supported minimum")]
    InvalidStackSize { size: usize },

    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};
