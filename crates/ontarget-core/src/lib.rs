//! # ontarget-core
//!
//! Debugger-mediated on-target test execution for embedded firmware.
//!
//! This crate provides the core engine, including:
//! - Session control over a debug adapter (connect, load, halt, resume)
//! - DWARF-backed symbol, type-layout, and source-location lookup
//! - Marshaling of host values into target memory representations
//! - On-target scratch memory under the NOALLOC, TESTHOOK, and PRESTACK models
//! - Synthetic AAPCS32 function calls with full context save and restore
//! - Rendezvous on named firmware labels
//!
//! ## Backends
//!
//! All target access goes through the [`adapter::DebugAdapter`] trait.
//! The built-in [`adapter::SimAdapter`] drives the engine without hardware;
//! real probes attach through an external GDB server behind the same trait.
//!
//! ## Threading
//!
//! A [`Session`] is a cheap clonable handle; clones share one target. Every
//! operation takes the session's single internal lock, and the long-running
//! ones (calls, label waits, memory-model arming) additionally hold a busy
//! flag so a concurrent attempt fails fast instead of queueing.

pub mod abi;
pub mod adapter;
pub mod breakpoints;
mod call;
pub mod config;
pub mod error;
pub mod marshal;
pub mod mem;
mod rendezvous;
pub mod session;
pub mod symbols;
pub mod types;

pub use session::Session;
// Re-export commonly used types
pub use config::TargetConfig;
pub use error::{OnTargetError, OnTargetResult};
pub use marshal::Value;
pub use mem::MemModel;
pub use rendezvous::LabelHit;
pub use session::RunState;
pub use types::{Address, Endianness};
