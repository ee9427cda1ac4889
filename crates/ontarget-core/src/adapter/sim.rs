//! # Simulated Adapter
//!
//! An in-process [`DebugAdapter`] with scriptable target behavior. A test
//! installs a closure that plays the role of the firmware: each time the
//! engine resumes the target, the closure inspects and mutates the
//! simulated register file and RAM, then decides how the "run" ends.
//!
//! The simulation is deliberately not an instruction-set emulator. It
//! models exactly what the engine can observe through a debug probe:
//! registers, memory, breakpoints, and halt events.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::trace;

use super::{DebugAdapter, HaltReason, TargetStatus};
use crate::config::TargetConfig;
use crate::error::{OnTargetError, OnTargetResult};
use crate::types::{Address, CoreRegister, RegisterFile};

/// Outcome of one scripted run of the simulated target.
#[derive(Debug, Clone, Copy)]
pub enum SimEvent
{
    /// Stop immediately at `pc`.
    Halt
    {
        /// Program counter to stop at.
        pc: u64,
        /// Reported stop reason.
        reason: HaltReason,
    },
    /// Keep reporting `Running` for `delay`, then stop at `pc`.
    HaltAfter
    {
        /// How long the target appears to run.
        delay: Duration,
        /// Program counter to stop at.
        pc: u64,
        /// Reported stop reason.
        reason: HaltReason,
    },
    /// Run forever (until the host requests a halt).
    KeepRunning,
}

/// Scripted firmware behavior, invoked once per resume.
pub type Behavior = Box<dyn FnMut(&mut SimState) -> SimEvent + Send>;

/// Scripted single-step behavior, invoked once per step request.
pub type StepBehavior = Box<dyn FnMut(&mut SimState) + Send>;

/// Simulated target RAM: one contiguous region.
#[derive(Debug, Clone)]
pub struct SimRam
{
    base: u64,
    bytes: Vec<u8>,
}

impl SimRam
{
    fn offset_of(&self, address: Address, len: usize) -> OnTargetResult<usize>
    {
        let addr = address.value();
        let end = addr.checked_add(len as u64);
        let limit = self.base + self.bytes.len() as u64;
        match end
        {
            Some(end) if addr >= self.base && end <= limit => Ok((addr - self.base) as usize),
            _ => Err(OnTargetError::Connection {
                details: format!(
                    "simulated memory access at {address} ({len} bytes) outside RAM \
                     0x{:08x}..0x{limit:08x}",
                    self.base
                ),
            }),
        }
    }

    fn read(&self, address: Address, len: usize) -> OnTargetResult<Vec<u8>>
    {
        let offset = self.offset_of(address, len)?;
        Ok(self.bytes[offset..offset + len].to_vec())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> OnTargetResult<()>
    {
        let offset = self.offset_of(address, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Everything a behavior closure can see and change.
pub struct SimState
{
    /// The integer register file.
    pub regs: RegisterFile,
    /// Target RAM.
    pub ram: SimRam,
    /// Addresses with an installed breakpoint.
    pub breakpoints: BTreeSet<u64>,
}

impl SimState
{
    /// Reads a little-endian word from RAM.
    ///
    /// ## Panics
    ///
    /// Panics on out-of-range accesses; behavior closures are test code
    /// and a bad address there is a bug in the test.
    #[must_use]
    pub fn read_u32(&self, address: u64) -> u32
    {
        let bytes = self.ram.read(Address::new(address), 4).unwrap();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Writes a little-endian word to RAM.
    ///
    /// ## Panics
    ///
    /// Panics on out-of-range accesses.
    pub fn write_u32(&mut self, address: u64, value: u32)
    {
        self.ram.write(Address::new(address), &value.to_le_bytes()).unwrap();
    }

    /// Reads raw bytes from RAM.
    ///
    /// ## Panics
    ///
    /// Panics on out-of-range accesses.
    #[must_use]
    pub fn read_bytes(&self, address: u64, len: usize) -> Vec<u8>
    {
        self.ram.read(Address::new(address), len).unwrap()
    }

    /// Writes raw bytes to RAM.
    ///
    /// ## Panics
    ///
    /// Panics on out-of-range accesses.
    pub fn write_bytes(&mut self, address: u64, data: &[u8])
    {
        self.ram.write(Address::new(address), data).unwrap()
    }

    /// Reads the `index`-th word-sized argument the way a callee built for
    /// the 32-bit Arm calling convention would: `r0`-`r3` first, then the
    /// stack.
    #[must_use]
    pub fn arg_word(&self, index: usize) -> u32
    {
        if index < 4
        {
            self.regs.get(CoreRegister::ARGUMENT[index])
        }
        else
        {
            self.read_u32(u64::from(self.regs.sp()) + 4 * (index as u64 - 4))
        }
    }

    /// Places a word-sized return value in `r0`.
    pub fn set_result(&mut self, value: u32)
    {
        self.regs.set(CoreRegister::R0, value);
    }

    /// Ends the scripted run by "returning" to the caller's link register.
    ///
    /// Reports a breakpoint stop when a breakpoint is installed there,
    /// which is how a real target would surface the engine's return trap.
    #[must_use]
    pub fn return_to_caller(&mut self) -> SimEvent
    {
        let ret = u64::from(self.regs.lr() & !1);
        let reason = if self.breakpoints.contains(&ret)
        {
            HaltReason::Breakpoint
        }
        else
        {
            HaltReason::Unknown
        };
        SimEvent::Halt { pc: ret, reason }
    }
}

enum SimRun
{
    Halted
    {
        pc: u64,
        reason: HaltReason,
    },
    Running,
    RunningUntil
    {
        at: Instant,
        pc: u64,
        reason: HaltReason,
    },
}

/// The scriptable in-process adapter.
pub struct SimAdapter
{
    state: SimState,
    behavior: Option<Behavior>,
    on_step: Option<StepBehavior>,
    run: SimRun,
    reset_regs: RegisterFile,
    connected: bool,
    loaded: Vec<PathBuf>,
}

impl SimAdapter
{
    /// Creates a simulated target with one RAM region. The stack pointer
    /// starts at the top of RAM.
    #[must_use]
    pub fn new(ram_base: u64, ram_size: usize) -> Self
    {
        let mut regs = RegisterFile::default();
        regs.set(CoreRegister::Sp, (ram_base + ram_size as u64) as u32);
        regs.set(CoreRegister::Xpsr, crate::types::registers::XPSR_THUMB_BIT);
        Self {
            state: SimState {
                regs,
                ram: SimRam { base: ram_base, bytes: vec![0; ram_size] },
                breakpoints: BTreeSet::new(),
            },
            behavior: None,
            on_step: None,
            run: SimRun::Halted { pc: 0, reason: HaltReason::Unknown },
            reset_regs: regs,
            connected: false,
            loaded: Vec::new(),
        }
    }

    /// Installs the firmware script.
    pub fn set_behavior(&mut self, behavior: impl FnMut(&mut SimState) -> SimEvent + Send + 'static)
    {
        self.behavior = Some(Box::new(behavior));
    }

    /// Installs a single-step script. Without one, a step just advances
    /// the program counter by one halfword.
    pub fn set_step_behavior(&mut self, on_step: impl FnMut(&mut SimState) + Send + 'static)
    {
        self.on_step = Some(Box::new(on_step));
    }

    /// Direct access to the simulated state, for test setup.
    pub fn state_mut(&mut self) -> &mut SimState
    {
        &mut self.state
    }

    /// Registers restored by a target reset. Defaults to the state at
    /// construction.
    pub fn set_reset_registers(&mut self, regs: RegisterFile)
    {
        self.reset_regs = regs;
    }

    /// Images the engine has asked to download.
    #[must_use]
    pub fn loaded_images(&self) -> &[PathBuf]
    {
        &self.loaded
    }

    fn require_connected(&self) -> OnTargetResult<()>
    {
        if self.connected
        {
            Ok(())
        }
        else
        {
            Err(OnTargetError::Connection { details: "simulated adapter is not connected".to_string() })
        }
    }

    fn settle(&mut self)
    {
        if let SimRun::RunningUntil { at, pc, reason } = self.run
        {
            if Instant::now() >= at
            {
                self.state.regs.set(CoreRegister::Pc, pc as u32);
                self.run = SimRun::Halted { pc, reason };
            }
        }
    }
}

impl DebugAdapter for SimAdapter
{
    fn connect(&mut self, config: &TargetConfig) -> OnTargetResult<()>
    {
        trace!(device = %config.device_name, "sim adapter connect");
        self.connected = true;
        self.run = SimRun::Halted { pc: u64::from(self.state.regs.pc()), reason: HaltReason::Request };
        Ok(())
    }

    fn disconnect(&mut self) -> OnTargetResult<()>
    {
        self.connected = false;
        Ok(())
    }

    fn load_image(&mut self, path: &Path) -> OnTargetResult<()>
    {
        self.require_connected()?;
        self.loaded.push(path.to_path_buf());
        Ok(())
    }

    fn reset(&mut self) -> OnTargetResult<()>
    {
        self.require_connected()?;
        self.state.regs = self.reset_regs;
        self.run =
            SimRun::Halted { pc: u64::from(self.reset_regs.pc()), reason: HaltReason::Reset };
        Ok(())
    }

    fn halt(&mut self) -> OnTargetResult<()>
    {
        self.require_connected()?;
        self.settle();
        if matches!(self.run, SimRun::Running | SimRun::RunningUntil { .. })
        {
            let pc = u64::from(self.state.regs.pc());
            self.run = SimRun::Halted { pc, reason: HaltReason::Request };
        }
        Ok(())
    }

    fn resume(&mut self) -> OnTargetResult<()>
    {
        self.require_connected()?;
        let event = match self.behavior.as_mut()
        {
            Some(behavior) => behavior(&mut self.state),
            None => SimEvent::KeepRunning,
        };
        self.run = match event
        {
            SimEvent::Halt { pc, reason } =>
            {
                self.state.regs.set(CoreRegister::Pc, pc as u32);
                SimRun::Halted { pc, reason }
            }
            SimEvent::HaltAfter { delay, pc, reason } =>
            {
                SimRun::RunningUntil { at: Instant::now() + delay, pc, reason }
            }
            SimEvent::KeepRunning => SimRun::Running,
        };
        Ok(())
    }

    fn step(&mut self) -> OnTargetResult<()>
    {
        self.require_connected()?;
        if let Some(on_step) = self.on_step.as_mut()
        {
            on_step(&mut self.state);
        }
        else
        {
            let pc = self.state.regs.pc().wrapping_add(2);
            self.state.regs.set(CoreRegister::Pc, pc);
        }
        let pc = u64::from(self.state.regs.pc());
        self.run = SimRun::Halted { pc, reason: HaltReason::Step };
        Ok(())
    }

    fn status(&mut self) -> OnTargetResult<TargetStatus>
    {
        self.require_connected()?;
        self.settle();
        Ok(match self.run
        {
            SimRun::Halted { pc, reason } =>
            {
                TargetStatus::Halted { pc: Address::new(pc), reason }
            }
            SimRun::Running | SimRun::RunningUntil { .. } => TargetStatus::Running,
        })
    }

    fn read_registers(&mut self) -> OnTargetResult<RegisterFile>
    {
        self.require_connected()?;
        Ok(self.state.regs)
    }

    fn write_registers(&mut self, registers: &RegisterFile) -> OnTargetResult<()>
    {
        self.require_connected()?;
        self.state.regs = *registers;
        Ok(())
    }

    fn read_memory(&mut self, address: Address, len: usize) -> OnTargetResult<Vec<u8>>
    {
        self.require_connected()?;
        self.state.ram.read(address, len)
    }

    fn write_memory(&mut self, address: Address, data: &[u8]) -> OnTargetResult<()>
    {
        self.require_connected()?;
        self.state.ram.write(address, data)
    }

    fn set_breakpoint(&mut self, address: Address) -> OnTargetResult<()>
    {
        self.require_connected()?;
        self.state.breakpoints.insert(address.value());
        Ok(())
    }

    fn clear_breakpoint(&mut self, address: Address) -> OnTargetResult<()>
    {
        self.require_connected()?;
        self.state.breakpoints.remove(&address.value());
        Ok(())
    }
}
