//! # Debug Adapters
//!
//! The seam between the session engine and whatever actually controls the
//! target. Everything the engine does to hardware goes through the
//! [`DebugAdapter`] trait: run control, register and memory access, and
//! breakpoints.
//!
//! Production sessions talk to an external GDB server (J-Link or OpenOCD).
//! The [`sim`] module provides a scriptable in-process adapter so the whole
//! engine can be exercised without hardware.

pub mod sim;

use std::path::Path;

use crate::config::{MonitorType, TargetConfig};
use crate::error::{OnTargetError, OnTargetResult};
use crate::types::{Address, RegisterFile};

/// Why a halted target stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason
{
    /// A breakpoint was hit.
    Breakpoint,
    /// The host asked for a halt.
    Request,
    /// The target came out of reset.
    Reset,
    /// A single step completed.
    Step,
    /// A fault or other exceptional stop.
    Fault,
    /// The adapter could not tell.
    Unknown,
}

impl std::fmt::Display for HaltReason
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Self::Breakpoint => write!(f, "breakpoint"),
            Self::Request => write!(f, "halt request"),
            Self::Reset => write!(f, "reset"),
            Self::Step => write!(f, "step"),
            Self::Fault => write!(f, "fault"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Current run state as reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus
{
    /// The target is executing.
    Running,
    /// The target is stopped.
    Halted
    {
        /// Program counter at the stop.
        pc: Address,
        /// Why it stopped.
        reason: HaltReason,
    },
}

/// Low-level control of one target through one debug probe.
///
/// Implementations do not interpret what they transfer. Deciding what a
/// register value means, where a breakpoint should go, or when a halt is
/// expected is the session engine's job; an adapter only moves bits and
/// reports state.
///
/// All methods are synchronous. The engine serializes access, so
/// implementations never see concurrent calls.
pub trait DebugAdapter: Send
{
    /// Establishes the connection described by `config`.
    fn connect(&mut self, config: &TargetConfig) -> OnTargetResult<()>;

    /// Tears the connection down. Called at most once, after which the
    /// adapter is dropped.
    fn disconnect(&mut self) -> OnTargetResult<()>;

    /// Downloads an image to the target.
    fn load_image(&mut self, path: &Path) -> OnTargetResult<()>;

    /// Resets the target and leaves it halted at the reset vector.
    fn reset(&mut self) -> OnTargetResult<()>;

    /// Requests a halt. Returns once the target is stopped.
    fn halt(&mut self) -> OnTargetResult<()>;

    /// Resumes execution.
    fn resume(&mut self) -> OnTargetResult<()>;

    /// Executes a single instruction.
    fn step(&mut self) -> OnTargetResult<()>;

    /// Reports the current run state.
    fn status(&mut self) -> OnTargetResult<TargetStatus>;

    /// Reads the full integer register file. The target must be halted.
    fn read_registers(&mut self) -> OnTargetResult<RegisterFile>;

    /// Writes the full integer register file. The target must be halted.
    fn write_registers(&mut self, registers: &RegisterFile) -> OnTargetResult<()>;

    /// Reads `len` bytes of target memory.
    fn read_memory(&mut self, address: Address, len: usize) -> OnTargetResult<Vec<u8>>;

    /// Writes bytes to target memory.
    fn write_memory(&mut self, address: Address, data: &[u8]) -> OnTargetResult<()>;

    /// Installs a breakpoint at an instruction address.
    fn set_breakpoint(&mut self, address: Address) -> OnTargetResult<()>;

    /// Removes the breakpoint at an instruction address.
    fn clear_breakpoint(&mut self, address: Address) -> OnTargetResult<()>;
}

/// Builds the adapter selected by the configuration.
///
/// ## Errors
///
/// Returns [`OnTargetError::Connection`] for monitor types that need an
/// external GDB server binary that is not managed by this crate.
pub fn create_adapter(config: &TargetConfig) -> OnTargetResult<Box<dyn DebugAdapter>>
{
    match config.monitor_type
    {
        MonitorType::Sim => Ok(Box::new(sim::SimAdapter::new(0x2000_0000, 64 * 1024))),
        MonitorType::Jlink | MonitorType::Openocd =>
        {
            let addr = config.gdb_server_addr.as_deref().unwrap_or("localhost");
            Err(OnTargetError::Connection {
                details: format!(
                    "monitor type '{}' requires an external GDB server at {}:{}; \
                     start it and connect with a remote-capable build",
                    config.monitor_type, addr, config.gdb_server_port
                ),
            })
        }
    }
}
