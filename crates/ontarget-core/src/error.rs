//! # Error Types
//!
//! Error handling for on-target test sessions.
//!
//! Every fallible operation in this crate returns [`OnTargetResult`], and
//! every failure is one of the variants of [`OnTargetError`]. The variants
//! are deliberately specific: test harnesses built on top of this crate
//! match on them to distinguish "the firmware misbehaved" from "the harness
//! was used incorrectly" from "the debug connection fell over".
//!
//! ## Example
//!
//! ```
//! use ontarget_core::error::{OnTargetError, OnTargetResult};
//!
//! fn check(value: u64) -> OnTargetResult<u64>
//! {
//!     if value > u64::from(u32::MAX)
//!     {
//!         return Err(OnTargetError::TypeMismatch {
//!             context: "check".to_string(),
//!             expected: "a 32-bit value".to_string(),
//!             found: value.to_string(),
//!         });
//!     }
//!     Ok(value)
//! }
//!
//! assert!(check(1 << 40).is_err());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::Address;

/// Result type used throughout the crate.
pub type OnTargetResult<T> = Result<T, OnTargetError>;

/// All errors that can occur while driving an on-target test session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OnTargetError
{
    /// The debug adapter could not be reached, or the transport failed
    /// mid-operation.
    ///
    /// This happens when:
    /// - The debug probe is unplugged or claimed by another process
    /// - The GDB server address in the configuration is wrong
    /// - The adapter reports a transport-level failure during an operation
    #[error("Debug adapter connection failed: {details}")]
    Connection
    {
        /// What the transport reported.
        details: String,
    },

    /// A firmware image could not be loaded onto the target.
    ///
    /// This happens when:
    /// - The ELF file does not exist or is not a valid object file
    /// - The adapter rejects the flash or RAM download
    #[error("Failed to load image {image:?}: {details}")]
    Load
    {
        /// Path of the image that failed to load.
        image: PathBuf,
        /// What went wrong.
        details: String,
    },

    /// A symbol name could not be resolved in any loaded image.
    ///
    /// This happens when:
    /// - The name is misspelled
    /// - The symbol was optimized out or lives in an image that was not
    ///   loaded into the session
    #[error("Unknown symbol: {name}")]
    UnknownSymbol
    {
        /// The name that failed to resolve.
        name: String,
    },

    /// A host value does not fit the target type it is being marshaled
    /// into, or a call was made with the wrong argument shape.
    #[error("Type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch
    {
        /// Where the mismatch was detected.
        context: String,
        /// What the target type requires.
        expected: String,
        /// What was actually supplied.
        found: String,
    },

    /// A value would not fit into the target buffer it was being written
    /// to. Nothing is written when this is reported.
    #[error("Buffer overflow in {context}: capacity {capacity} bytes, required {required}")]
    BufferOverflow
    {
        /// What was being written.
        context: String,
        /// Capacity of the destination in bytes.
        capacity: usize,
        /// Bytes the value actually needs.
        required: usize,
    },

    /// An allocation or placement request used an alignment the engine
    /// cannot honor.
    ///
    /// Alignments must be powers of two, and on-target allocations are
    /// placed at the natural alignment of their type.
    #[error("Invalid alignment {align} for {context}")]
    InvalidAlignment
    {
        /// What was being aligned.
        context: String,
        /// The offending alignment value.
        align: u64,
    },

    /// The on-target memory budget is exhausted.
    ///
    /// The scratch region backing the allocator is a fixed size. This is a
    /// hard error; the engine never grows the region or retries.
    #[error("Out of target memory: requested {requested} bytes, {available} available")]
    OutOfMemory
    {
        /// Bytes requested.
        requested: u64,
        /// Bytes still free in the region.
        available: u64,
    },

    /// The operation is not available under the session's current
    /// configuration.
    ///
    /// This happens when:
    /// - Allocation is attempted while the memory model is `NOALLOC`
    /// - An allocation-dependent feature (such as returning a struct by
    ///   hidden pointer) is used without a usable allocator
    #[error("Unsupported operation {operation}: {details}")]
    UnsupportedOperation
    {
        /// The operation that was refused.
        operation: String,
        /// Why it is unavailable.
        details: String,
    },

    /// A typed pointer from a previous target run was dereferenced.
    ///
    /// Allocations handed out by the test-hook memory model live in a
    /// stack frame of the firmware's hook function. Resuming the firmware
    /// destroys that frame, so older pointers are refused instead of
    /// silently reading garbage.
    #[error("Stale allocation at {address}: the target has resumed since it was made")]
    StaleAllocation
    {
        /// Address of the stale allocation.
        address: Address,
    },

    /// A blocking operation did not finish within its deadline.
    ///
    /// A timed-out call halts the target and restores the interrupted
    /// state. A timed-out label wait leaves the firmware running with the
    /// label still armed, so a later wait can pick the hit up.
    #[error("Timed out after {waited:?} (limit {limit:?}) waiting for {what}")]
    Timeout
    {
        /// What the engine was waiting for.
        what: String,
        /// How long it actually waited.
        waited: Duration,
        /// The configured limit.
        limit: Duration,
    },

    /// The target stopped somewhere the engine did not expect.
    ///
    /// This happens when:
    /// - The firmware hits a fault or a foreign breakpoint during a
    ///   synthetic function call
    /// - A label breakpoint fires while a call is in flight
    #[error("Unexpected halt at {pc} while {context}")]
    UnexpectedHalt
    {
        /// Where the target stopped.
        pc: Address,
        /// What the engine was doing at the time.
        context: String,
    },

    /// Another blocking operation is already running on this session.
    ///
    /// Sessions execute one synthetic call or label wait at a time; there
    /// is no queueing. Callers decide whether to retry.
    #[error("Session is busy with another operation (attempted {operation})")]
    SessionBusy
    {
        /// The operation that was refused.
        operation: &'static str,
    },

    /// The session has been torn down.
    ///
    /// Operations that were blocked when [`disconnect`] ran are unblocked
    /// with this error, and every later operation fails the same way.
    ///
    /// [`disconnect`]: crate::session::Session::disconnect
    #[error("Session is closed")]
    SessionClosed,

    /// The session configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error while reading an image or symbol file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An object or DWARF parsing problem in a symbol file.
    ///
    /// This happens when:
    /// - The ELF file is truncated or malformed
    /// - Debug info is missing for a type or function the test needs
    /// - The DWARF data uses a construct the layout reader does not handle
    #[error("Debug info error in {context}: {details}")]
    DebugInfo
    {
        /// What was being read.
        context: String,
        /// The underlying parser message.
        details: String,
    },
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_error_messages_are_descriptive()
    {
        let err = OnTargetError::UnknownSymbol { name: "example_Addition".to_string() };
        assert!(err.to_string().contains("example_Addition"));

        let err = OnTargetError::OutOfMemory { requested: 64, available: 12 };
        let msg = err.to_string();
        assert!(msg.contains("64"));
        assert!(msg.contains("12"));
    }

    #[test]
    fn test_io_error_conversion()
    {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: OnTargetError = io.into();
        assert!(matches!(err, OnTargetError::Io(_)));
    }
}
