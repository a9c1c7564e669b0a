//! # Errors
//!
//! Classified failures of the attachment pipeline. Errors travel in
//! `anyhow` chains; callers reacting to a specific class can downcast to
//! [`Error`].

/// Attachment pipeline error classes.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad glob pattern or bad option values.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No function survived selection, or a required kernel table is
    /// missing.
    #[error("not found: {0}")]
    NotFound(String),
    /// Reading a kernel table failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The kernel verifier rejected a program.
    #[error("verifier: {0}")]
    Verifier(String),
    /// Raising a process resource limit failed.
    #[error("resource limit: {0}")]
    Resource(String),
    /// An attach syscall failed.
    #[error("kernel: {0}")]
    Kernel(String),
}
