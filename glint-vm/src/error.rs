//! Host-boundary error types.
//!
//! Inside the VM, failures are exception *values*: every fallible runtime
//! operation returns `Result<Value, Value>` with the raised exception in the
//! `Err` slot, and no Rust unwinding crosses the dispatch loop. `VmError`
//! exists for embedders that want a conventional error type at the outermost
//! boundary.

use thiserror::Error;

use crate::value::Value;

/// Host-facing error.
#[derive(Debug, Error)]
pub enum VmError {
    /// An exception escaped the outermost call frame.
    #[error("uncaught exception: {0}")]
    UncaughtException(String),
    /// The page allocator returned null.
    #[error("out of memory")]
    OutOfMemory,
    /// A non-function value was invoked from the host.
    #[error("invoking a non-function value")]
    NotAFunction,
}

impl VmError {
    /// Converts an escaped exception value into a host error.
    pub fn from_exception(e: Value) -> Self {
        if let Some(s) = e.as_string() {
            if s.as_str() == "out of memory" {
                return Self::OutOfMemory;
            }
            return Self::UncaughtException(s.as_str().to_owned());
        }
        Self::UncaughtException(format!("{e:?}"))
    }
}
