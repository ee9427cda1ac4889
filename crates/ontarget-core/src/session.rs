//! # Sessions
//!
//! The session is the front door of the engine: one [`Session`] owns one
//! debug connection to one target and everything the engine knows about
//! it. All public operations go through it.
//!
//! A session is a small state machine. It is born `HALTED` by
//! [`Session::connect`], moves between `HALTED` and `RUNNING` through
//! halt, resume, calls and label waits, and ends `DISCONNECTED` exactly
//! once. Internally a single mutex serializes every target-touching
//! operation; the hardware link has no notion of concurrent commands.
//! Blocking operations ([`Session::invoke`], [`Session::wait_for_label`])
//! additionally take a busy flag so a second blocking caller fails fast
//! with [`OnTargetError::SessionBusy`] instead of queueing behind a wait
//! that may take seconds.
//!
//! Teardown is cooperative: [`Session::disconnect`] first marks the
//! session closed, which every poll loop checks, so blocked waiters
//! return [`OnTargetError::SessionClosed`] and release the lock before
//! the breakpoints and the adapter connection are torn down.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::abi;
use crate::adapter::{create_adapter, DebugAdapter, HaltReason, TargetStatus};
use crate::breakpoints::{BreakpointRecord, BreakpointStore};
use crate::call;
use crate::config::TargetConfig;
use crate::error::{OnTargetError, OnTargetResult};
use crate::marshal::{Marshaler, Value};
use crate::mem::{Allocation, Allocator, MemModel, Region, ScratchMem, TypedPtr};
use crate::rendezvous::{self, LabelBook, LabelHit};
use crate::symbols::{FunctionSignature, Image, Location, Symbol, SymbolTable, TypeLayout};
use crate::types::registers::{describe_xpsr, xpsr_in_it_block};
use crate::types::{Address, CoreRegister, Endianness, RegisterFile};

/// How often poll loops sample the target's run state.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Largest single memory transfer pushed through the adapter.
const MEM_CHUNK: usize = 1024;

/// Most single steps taken to leave an IT block after a halt.
const MAX_IT_STEPS: usize = 8;

/// Firmware symbol the `TESTHOOK` memory model rendezvouses at. The hook
/// receives the scratch buffer pointer in `r0` and its size in `r1`.
const TEST_HOOK_SYMBOL: &str = "ontarget_test_hook_chained";

/// Target run state as tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState
{
    /// No live connection. Terminal once reached through
    /// [`Session::disconnect`].
    Disconnected,
    /// The target is stopped and can be inspected.
    Halted,
    /// The target is executing firmware.
    Running,
}

impl std::fmt::Display for RunState
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Halted => write!(f, "halted"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Everything behind the session mutex.
pub(crate) struct SessionCore
{
    pub(crate) adapter: Box<dyn DebugAdapter>,
    pub(crate) config: TargetConfig,
    pub(crate) run_state: RunState,
    pub(crate) images: Vec<Arc<Image>>,
    pub(crate) symbols: SymbolTable,
    pub(crate) allocator: Allocator,
    pub(crate) breakpoints: BreakpointStore,
    pub(crate) labels: LabelBook,
    /// Counts every resume that hands control back to the firmware.
    /// Allocations whose lifetime ends when the firmware moves on carry
    /// the epoch they were made in.
    pub(crate) resume_epoch: u64,
    /// The most recent stop nobody has consumed yet.
    pub(crate) last_stop: Option<(Address, HaltReason)>,
}

impl SessionCore
{
    pub(crate) fn marshaler(&self) -> Marshaler<'_>
    {
        Marshaler::with_symbols(self.config.device_endianness, &self.symbols)
    }

    /// Resumes the firmware and advances the resume epoch. Synthetic
    /// calls bypass this and resume the adapter directly, because they
    /// restore the exact pre-call state afterwards.
    pub(crate) fn resume_flow(&mut self) -> OnTargetResult<()>
    {
        self.adapter.resume()?;
        self.run_state = RunState::Running;
        self.resume_epoch += 1;
        self.last_stop = None;
        trace!(epoch = self.resume_epoch, "target resumed");
        Ok(())
    }

    /// Halts the target. A halt can land inside an IT block; the engine
    /// steps clear of it before anything else edits `xPSR`.
    pub(crate) fn halt_now(&mut self) -> OnTargetResult<(Address, HaltReason)>
    {
        self.adapter.halt()?;
        let reason = match self.adapter.status()?
        {
            TargetStatus::Halted { reason, .. } => reason,
            TargetStatus::Running =>
            {
                return Err(OnTargetError::Connection {
                    details: "target did not halt on request".to_string(),
                });
            }
        };
        let mut regs = self.adapter.read_registers()?;
        let mut steps = 0;
        while xpsr_in_it_block(regs.xpsr())
        {
            if steps == MAX_IT_STEPS
            {
                return Err(OnTargetError::UnexpectedHalt {
                    pc: Address::new(u64::from(regs.pc())).code_address(),
                    context: "could not step clear of an IT block after halting".to_string(),
                });
            }
            debug!(xpsr = %describe_xpsr(regs.xpsr()), "stepping clear of an IT block");
            self.adapter.step()?;
            regs = self.adapter.read_registers()?;
            steps += 1;
        }
        let pc = Address::new(u64::from(regs.pc())).code_address();
        self.run_state = RunState::Halted;
        self.last_stop = Some((pc, reason));
        debug!(%pc, %reason, "target halted");
        Ok((pc, reason))
    }

    /// Makes sure the target is halted, returning `true` when it had to
    /// be stopped first.
    pub(crate) fn ensure_halted(&mut self) -> OnTargetResult<bool>
    {
        match self.run_state
        {
            RunState::Running =>
            {
                self.halt_now()?;
                Ok(true)
            }
            RunState::Halted => Ok(false),
            RunState::Disconnected => Err(OnTargetError::SessionClosed),
        }
    }

    pub(crate) fn expect_halted(&self, operation: &'static str) -> OnTargetResult<()>
    {
        if self.run_state == RunState::Halted
        {
            return Ok(());
        }
        Err(OnTargetError::UnsupportedOperation {
            operation: operation.to_string(),
            details: format!("the target must be halted, but is {}", self.run_state),
        })
    }

    /// Polls until the target stops, the session closes, or `limit`
    /// elapses since `started`. On a stop, records it as the current
    /// unconsumed stop. On timeout the target is left running; the
    /// caller decides whether to halt it.
    pub(crate) fn wait_for_stop(
        &mut self,
        closed: &AtomicBool,
        started: Instant,
        limit: Duration,
        what: &str,
    ) -> OnTargetResult<(Address, HaltReason)>
    {
        loop
        {
            if closed.load(Ordering::Acquire)
            {
                return Err(OnTargetError::SessionClosed);
            }
            match self.adapter.status()?
            {
                TargetStatus::Halted { pc, reason } =>
                {
                    self.run_state = RunState::Halted;
                    self.last_stop = Some((pc, reason));
                    trace!(%pc, %reason, "target stopped");
                    return Ok((pc, reason));
                }
                TargetStatus::Running =>
                {
                    let waited = started.elapsed();
                    if waited >= limit
                    {
                        return Err(OnTargetError::Timeout {
                            what: what.to_string(),
                            waited,
                            limit,
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    pub(crate) fn read_mem_raw(&mut self, address: Address, len: usize) -> OnTargetResult<Vec<u8>>
    {
        let mut data = Vec::with_capacity(len);
        let mut cursor = address;
        while data.len() < len
        {
            let chunk_len = MEM_CHUNK.min(len - data.len());
            let chunk = self.adapter.read_memory(cursor, chunk_len)?;
            if chunk.len() != chunk_len
            {
                return Err(OnTargetError::Connection {
                    details: format!(
                        "short read at {cursor}: wanted {chunk_len} bytes, got {}",
                        chunk.len()
                    ),
                });
            }
            data.extend_from_slice(&chunk);
            cursor = cursor + chunk_len as u64;
        }
        Ok(data)
    }

    pub(crate) fn write_mem_raw(&mut self, address: Address, data: &[u8]) -> OnTargetResult<()>
    {
        let mut cursor = address;
        for chunk in data.chunks(MEM_CHUNK)
        {
            self.adapter.write_memory(cursor, chunk)?;
            cursor = cursor + chunk.len() as u64;
        }
        Ok(())
    }

    /// Looks a type layout up across every attached image.
    pub(crate) fn find_layout(&self, name: &str) -> OnTargetResult<Arc<TypeLayout>>
    {
        for image in &self.images
        {
            match image.type_layout(name)
            {
                Ok(layout) => return Ok(layout),
                Err(OnTargetError::UnknownSymbol { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Err(OnTargetError::UnknownSymbol { name: name.to_string() })
    }

    /// Looks a function signature up across every attached image.
    pub(crate) fn find_signature(&self, name: &str) -> OnTargetResult<Arc<FunctionSignature>>
    {
        for image in &self.images
        {
            match image.function_signature(name)
            {
                Ok(signature) => return Ok(signature),
                Err(OnTargetError::UnknownSymbol { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Err(OnTargetError::UnknownSymbol { name: name.to_string() })
    }

    pub(crate) fn check_epoch(&self, epoch: Option<u64>, address: Address) -> OnTargetResult<()>
    {
        if epoch.is_some_and(|e| e != self.resume_epoch)
        {
            return Err(OnTargetError::StaleAllocation { address });
        }
        Ok(())
    }

    /// Human-readable description of an address, with source location
    /// when debug info provides one.
    pub(crate) fn describe_address(&self, address: Address) -> String
    {
        if let Some(location) = self.images.iter().find_map(|image| image.locate(address))
        {
            return format!("{address} ({location})");
        }
        if let Some(symbol) = self.symbols.containing(address)
        {
            return format!("{address} ({})", symbol.display_name());
        }
        address.to_string()
    }
}

struct SessionInner
{
    core: Mutex<SessionCore>,
    closed: AtomicBool,
    busy: AtomicBool,
    default_timeout: Duration,
}

impl Drop for SessionInner
{
    fn drop(&mut self)
    {
        if self.closed.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let core = match self.core.get_mut()
        {
            Ok(core) => core,
            Err(poisoned) => poisoned.into_inner(),
        };
        teardown(core);
    }
}

/// Marks the session busy for the lifetime of a blocking operation.
struct BusyGuard<'a>
{
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a>
{
    fn acquire(flag: &'a AtomicBool, operation: &'static str) -> OnTargetResult<Self>
    {
        if flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
        {
            Ok(Self { flag })
        }
        else
        {
            Err(OnTargetError::SessionBusy { operation })
        }
    }
}

impl Drop for BusyGuard<'_>
{
    fn drop(&mut self)
    {
        self.flag.store(false, Ordering::Release);
    }
}

/// One live connection to one target.
///
/// Cloning a `Session` is cheap and shares the connection, so one thread
/// can block in [`Session::wait_for_label`] while another calls
/// [`Session::disconnect`] to unblock it.
///
/// ## Example
///
/// ```no_run
/// use ontarget_core::adapter::sim::SimAdapter;
/// use ontarget_core::config::TargetConfig;
/// use ontarget_core::marshal::Value;
/// use ontarget_core::session::Session;
///
/// # fn main() -> ontarget_core::OnTargetResult<()> {
/// let config = TargetConfig::new("STM32F072RB", "firmware.elf");
/// let adapter = Box::new(SimAdapter::new(0x2000_0000, 0x1_0000));
/// let session = Session::connect_with(adapter, config)?;
///
/// let sum = session.invoke("example_Addition", &[Value::UInt(31), Value::UInt(11)])?;
/// println!("example_Addition returned {sum}");
///
/// session.disconnect()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session
{
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Session")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .field("busy", &self.inner.busy.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Session
{
    /// Connects to the target described by `config`, using the adapter
    /// the configuration selects.
    ///
    /// The target is halted before this returns.
    ///
    /// ## Errors
    ///
    /// Returns [`OnTargetError::Config`] for an invalid configuration and
    /// [`OnTargetError::Connection`] when the adapter cannot reach the
    /// target.
    pub fn connect(config: TargetConfig) -> OnTargetResult<Self>
    {
        config.validate()?;
        let adapter = create_adapter(&config)?;
        Self::connect_with(adapter, config)
    }

    /// Connects through a caller-supplied adapter. This is how tests
    /// drive the engine against [`SimAdapter`].
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::connect`].
    ///
    /// [`SimAdapter`]: crate::adapter::sim::SimAdapter
    pub fn connect_with(
        mut adapter: Box<dyn DebugAdapter>,
        config: TargetConfig,
    ) -> OnTargetResult<Self>
    {
        config.validate()?;
        adapter.connect(&config)?;
        let default_timeout = config.default_timeout();
        let allocator = Allocator::new(config.on_target_mem_model);
        let mut core = SessionCore {
            adapter,
            config,
            run_state: RunState::Halted,
            images: Vec::new(),
            symbols: SymbolTable::new(),
            allocator,
            breakpoints: BreakpointStore::new(),
            labels: LabelBook::default(),
            resume_epoch: 0,
            last_stop: None,
        };
        match core.adapter.status()?
        {
            TargetStatus::Running =>
            {
                core.halt_now()?;
            }
            TargetStatus::Halted { pc, reason } =>
            {
                core.last_stop = Some((pc, reason));
            }
        }
        info!(device = %core.config.device_name, "connected to target");
        Ok(Self {
            inner: Arc::new(SessionInner {
                core: Mutex::new(core),
                closed: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                default_timeout,
            }),
        })
    }

    fn lock_core(&self) -> OnTargetResult<MutexGuard<'_, SessionCore>>
    {
        if self.inner.closed.load(Ordering::Acquire)
        {
            return Err(OnTargetError::SessionClosed);
        }
        self.inner.core.lock().map_err(|_| OnTargetError::SessionClosed)
    }

    /// The timeout applied when an operation is not given one.
    #[must_use]
    pub fn default_timeout(&self) -> Duration
    {
        self.inner.default_timeout
    }

    /// Current run state. Reports [`RunState::Disconnected`] once the
    /// session has been closed.
    #[must_use]
    pub fn run_state(&self) -> RunState
    {
        if self.inner.closed.load(Ordering::Acquire)
        {
            return RunState::Disconnected;
        }
        self.inner.core.lock().map_or(RunState::Disconnected, |core| core.run_state)
    }

    /// Downloads an ELF to the target, resets it, and attaches the
    /// file's symbols and debug info.
    ///
    /// Loading invalidates any armed memory model; call
    /// [`Session::arm_memory_model`] again afterwards.
    ///
    /// ## Errors
    ///
    /// Returns [`OnTargetError::Load`] when the file cannot be read or
    /// parsed, and adapter errors when the download fails.
    pub fn load_image(&self, path: impl AsRef<Path>) -> OnTargetResult<Arc<Image>>
    {
        let image = Image::from_elf(path)?;
        let mut core = self.lock_core()?;
        core.adapter.load_image(image.path())?;
        core.adapter.reset()?;
        core.run_state = RunState::Halted;
        core.resume_epoch += 1;
        core.last_stop = None;
        core.allocator.disarm();
        info!(image = %image.path().display(), "image loaded");
        Ok(attach_locked(&mut core, image, 0))
    }

    /// Attaches symbols and debug info without downloading anything.
    pub fn attach_image(&self, image: Image) -> OnTargetResult<Arc<Image>>
    {
        let mut core = self.lock_core()?;
        Ok(attach_locked(&mut core, image, 0))
    }

    /// Attaches symbols with every address shifted by `offset`. Used for
    /// bootloader symbol files linked at address zero.
    pub fn attach_image_at(&self, image: Image, offset: u64) -> OnTargetResult<Arc<Image>>
    {
        let mut core = self.lock_core()?;
        Ok(attach_locked(&mut core, image, offset))
    }

    /// Loads and attaches everything the configuration names: the
    /// bootloader image and symbols when configured, then the
    /// application image and its symbol file.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::load_image`].
    pub fn load_from_config(&self) -> OnTargetResult<()>
    {
        let (app_load, app_symbols, bl_load, bl_symbols, bl_addr) = {
            let core = self.lock_core()?;
            (
                core.config.app_load_elf.clone(),
                core.config.symbol_elf().to_path_buf(),
                core.config.bl_load_elf.clone(),
                core.config.bl_symbol_elf.clone(),
                core.config.bl_symbol_addr,
            )
        };
        if let Some(bl) = bl_load
        {
            let image = Image::from_elf(&bl)?;
            let mut core = self.lock_core()?;
            core.adapter.load_image(image.path())?;
            attach_locked(&mut core, image, 0);
        }
        if let Some(bl_sym) = bl_symbols
        {
            let offset = bl_addr.unwrap_or(0);
            self.attach_image_at(Image::from_elf(bl_sym)?, offset)?;
        }
        self.load_image(&app_load)?;
        if app_symbols != app_load
        {
            self.attach_image(Image::from_elf(app_symbols)?)?;
        }
        Ok(())
    }

    /// Halts the target, returning the program counter it stopped at.
    /// Already-halted targets are left alone.
    ///
    /// ## Errors
    ///
    /// Adapter errors, or [`OnTargetError::SessionClosed`] afterwards.
    pub fn halt(&self) -> OnTargetResult<Address>
    {
        let mut core = self.lock_core()?;
        match core.run_state
        {
            RunState::Running => Ok(core.halt_now()?.0),
            RunState::Halted =>
            {
                let regs = core.adapter.read_registers()?;
                Ok(Address::new(u64::from(regs.pc())).code_address())
            }
            RunState::Disconnected => Err(OnTargetError::SessionClosed),
        }
    }

    /// Resumes the firmware. A no-op when it is already running.
    ///
    /// Resuming invalidates `TESTHOOK` allocations; their epoch is over.
    ///
    /// ## Errors
    ///
    /// Adapter errors, or [`OnTargetError::SessionClosed`].
    pub fn resume(&self) -> OnTargetResult<()>
    {
        let mut core = self.lock_core()?;
        match core.run_state
        {
            RunState::Running =>
            {
                trace!("resume requested while already running");
                Ok(())
            }
            RunState::Halted => core.resume_flow(),
            RunState::Disconnected => Err(OnTargetError::SessionClosed),
        }
    }

    /// Executes a single instruction, returning the new program counter.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnsupportedOperation`] when the target is not
    /// halted.
    pub fn step_insn(&self) -> OnTargetResult<Address>
    {
        let mut core = self.lock_core()?;
        core.expect_halted("step")?;
        core.adapter.step()?;
        let regs = core.adapter.read_registers()?;
        let pc = Address::new(u64::from(regs.pc())).code_address();
        core.last_stop = Some((pc, HaltReason::Step));
        Ok(pc)
    }

    /// Resets the target and drops everything tied to the old run:
    /// breakpoints, labels, and the armed memory model.
    ///
    /// ## Errors
    ///
    /// Adapter errors, or [`OnTargetError::SessionClosed`].
    pub fn reset(&self) -> OnTargetResult<()>
    {
        let mut core = self.lock_core()?;
        for record in core.breakpoints.drain()
        {
            if let Err(err) = core.adapter.clear_breakpoint(record.address)
            {
                warn!(address = %record.address, %err, "failed to clear breakpoint during reset");
            }
        }
        core.labels.clear();
        core.allocator.disarm();
        core.adapter.reset()?;
        core.run_state = RunState::Halted;
        core.resume_epoch += 1;
        core.last_stop = None;
        info!("target reset");
        Ok(())
    }

    /// Closes the session. Idempotent.
    ///
    /// Pending waiters observe the closed flag on their next poll and
    /// return [`OnTargetError::SessionClosed`]; this call then removes
    /// every installed breakpoint and drops the connection. Cleanup
    /// failures are logged, never propagated, so teardown always
    /// completes.
    pub fn disconnect(&self) -> OnTargetResult<()>
    {
        if self.inner.closed.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        let mut core = match self.inner.core.lock()
        {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        teardown(&mut core);
        Ok(())
    }

    /// Resolves a symbol name to its table entry.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnknownSymbol`] when no attached image defines it.
    pub fn resolve(&self, name: &str) -> OnTargetResult<Arc<Symbol>>
    {
        self.lock_core()?.symbols.resolve(name)
    }

    /// The exact layout of a type, straight from debug info.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnknownSymbol`] when no attached image defines
    /// the type, [`OnTargetError::DebugInfo`] when its DWARF is
    /// malformed.
    pub fn type_layout(&self, name: &str) -> OnTargetResult<Arc<TypeLayout>>
    {
        self.lock_core()?.find_layout(name)
    }

    /// `sizeof(type)` on the target, from debug info.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::type_layout`].
    pub fn sizeof(&self, name: &str) -> OnTargetResult<u64>
    {
        Ok(self.type_layout(name)?.size())
    }

    /// Parameter and return types of a function, from debug info.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::type_layout`].
    pub fn function_signature(&self, name: &str) -> OnTargetResult<Arc<FunctionSignature>>
    {
        self.lock_core()?.find_signature(name)
    }

    /// Source location of an address, when debug info knows it.
    #[must_use]
    pub fn locate(&self, address: Address) -> Option<Location>
    {
        let core = self.lock_core().ok()?;
        core.images.iter().find_map(|image| image.locate(address)).or_else(|| {
            core.symbols.containing(address).map(|symbol| Location {
                function: Some(symbol.display_name().to_string()),
                file: None,
                line: None,
            })
        })
    }

    /// Reads raw target memory.
    ///
    /// ## Errors
    ///
    /// Adapter errors, or [`OnTargetError::SessionClosed`].
    pub fn read_mem(&self, address: Address, len: usize) -> OnTargetResult<Vec<u8>>
    {
        self.lock_core()?.read_mem_raw(address, len)
    }

    /// Writes raw target memory.
    ///
    /// ## Errors
    ///
    /// Adapter errors, or [`OnTargetError::SessionClosed`].
    pub fn write_mem(&self, address: Address, data: &[u8]) -> OnTargetResult<()>
    {
        self.lock_core()?.write_mem_raw(address, data)
    }

    /// Reads one word in the target's byte order.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::read_mem`].
    pub fn read_u32(&self, address: Address) -> OnTargetResult<u32>
    {
        let mut core = self.lock_core()?;
        let bytes = core.read_mem_raw(address, 4)?;
        let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| OnTargetError::Connection {
            details: format!("short word read at {address}"),
        })?;
        Ok(match core.config.device_endianness
        {
            Endianness::Little => u32::from_le_bytes(raw),
            Endianness::Big => u32::from_be_bytes(raw),
        })
    }

    /// Writes one word in the target's byte order.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::write_mem`].
    pub fn write_u32(&self, address: Address, value: u32) -> OnTargetResult<()>
    {
        let mut core = self.lock_core()?;
        let bytes = match core.config.device_endianness
        {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };
        core.write_mem_raw(address, &bytes)
    }

    /// Reads a NUL-terminated string from target memory, up to `max_len`
    /// bytes. Invalid UTF-8 is replaced, not rejected.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::read_mem`].
    pub fn read_cstring(&self, address: Address, max_len: usize) -> OnTargetResult<String>
    {
        let mut core = self.lock_core()?;
        let mut collected: Vec<u8> = Vec::new();
        let mut cursor = address;
        while collected.len() < max_len
        {
            let chunk_len = 64.min(max_len - collected.len());
            let chunk = core.read_mem_raw(cursor, chunk_len)?;
            if let Some(nul) = chunk.iter().position(|&b| b == 0)
            {
                collected.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&collected).into_owned());
            }
            collected.extend_from_slice(&chunk);
            cursor = cursor + chunk_len as u64;
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Snapshot of the integer register file. The target must be halted.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnsupportedOperation`] when the target is
    /// running.
    pub fn read_registers(&self) -> OnTargetResult<RegisterFile>
    {
        let mut core = self.lock_core()?;
        core.expect_halted("read_registers")?;
        core.adapter.read_registers()
    }

    /// Writes the full integer register file. The target must be halted.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnsupportedOperation`] when the target is
    /// running.
    pub fn write_registers(&self, registers: &RegisterFile) -> OnTargetResult<()>
    {
        let mut core = self.lock_core()?;
        core.expect_halted("write_registers")?;
        core.adapter.write_registers(registers)
    }

    /// Reads one register by name, e.g. `"r0"`, `"sp"`, `"xpsr"`.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnknownSymbol`] for names that are not core
    /// registers.
    pub fn read_reg(&self, name: &str) -> OnTargetResult<u32>
    {
        let register = parse_register(name)?;
        Ok(self.read_registers()?.get(register))
    }

    /// Writes one register by name.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::read_reg`].
    pub fn write_reg(&self, name: &str, value: u32) -> OnTargetResult<()>
    {
        let register = parse_register(name)?;
        let mut core = self.lock_core()?;
        core.expect_halted("write_reg")?;
        let mut regs = core.adapter.read_registers()?;
        regs.set(register, value);
        core.adapter.write_registers(&regs)
    }

    /// The memory model this session was configured with.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::SessionClosed`] after disconnect.
    pub fn memory_model(&self) -> OnTargetResult<MemModel>
    {
        Ok(self.lock_core()?.allocator.model())
    }

    /// Sets the configured memory model up on the target, running the
    /// firmware as far as the model requires.
    ///
    /// Under `PRESTACK` this runs to the configured allocation location,
    /// moves the stack pointer down by the configured budget, and runs on
    /// to the halt location. Under `TESTHOOK` it runs until the firmware
    /// enters the test hook and reads the published buffer. `NOALLOC`
    /// needs no arming.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::Timeout`] when the firmware never reaches the
    /// test hook, [`OnTargetError::SessionBusy`] while another blocking
    /// operation is in flight.
    pub fn arm_memory_model(&self, timeout: Option<Duration>) -> OnTargetResult<()>
    {
        if self.inner.closed.load(Ordering::Acquire)
        {
            return Err(OnTargetError::SessionClosed);
        }
        let _busy = BusyGuard::acquire(&self.inner.busy, "arm_memory_model")?;
        let mut core = self.lock_core()?;
        let limit = timeout.unwrap_or(self.inner.default_timeout);
        match core.allocator.model()
        {
            MemModel::NoAlloc =>
            {
                debug!("memory model NOALLOC needs no arming");
                Ok(())
            }
            MemModel::PreStack => arm_prestack(&mut core, &self.inner.closed, limit),
            MemModel::TestHook => arm_testhook(&mut core, &self.inner.closed, limit),
        }
    }

    /// Allocates raw on-target bytes from the armed memory model.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Allocator::alloc`].
    pub fn alloc_bytes(&self, size: u64, align: u64) -> OnTargetResult<Allocation>
    {
        let mut core = self.lock_core()?;
        let epoch = core.resume_epoch;
        core.allocator.alloc(size, align, epoch)
    }

    /// Allocates `count` on-target values of a named type at its natural
    /// alignment, optionally writing an initial value into every element.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Allocator::alloc`], plus
    /// [`OnTargetError::UnknownSymbol`] for unknown types and
    /// [`OnTargetError::TypeMismatch`] when the initializer does not fit
    /// the type.
    pub fn alloc_typed(
        &self,
        type_name: &str,
        count: u64,
        init: Option<&Value>,
    ) -> OnTargetResult<TypedPtr>
    {
        let mut core = self.lock_core()?;
        let layout = core.find_layout(type_name)?;
        let epoch = core.resume_epoch;
        let allocation =
            core.allocator.alloc(layout.size() * count, layout.alignment().max(1), epoch)?;
        let ptr = TypedPtr::new(allocation.address, layout, count, allocation.epoch);
        if let Some(value) = init
        {
            let bytes = core.marshaler().encode(value, ptr.layout())?;
            for index in 0..count
            {
                let element = ptr.element(index)?;
                core.write_mem_raw(element, &bytes)?;
            }
        }
        Ok(ptr)
    }

    /// Returns an allocation. Space only comes back through a reset of
    /// the memory model.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnsupportedOperation`] under `NOALLOC`.
    pub fn free(&self, allocation: &Allocation) -> OnTargetResult<()>
    {
        self.lock_core()?.allocator.free(allocation)
    }

    /// Returns a typed allocation.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::free`].
    pub fn free_typed(&self, ptr: &TypedPtr) -> OnTargetResult<()>
    {
        let allocation =
            Allocation { address: ptr.address(), size: ptr.byte_size(), epoch: ptr.epoch() };
        self.free(&allocation)
    }

    /// Reads the first element behind a typed pointer.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::StaleAllocation`] when the allocation's epoch is
    /// over.
    pub fn read_typed(&self, ptr: &TypedPtr) -> OnTargetResult<Value>
    {
        self.read_typed_element(ptr, 0)
    }

    /// Reads element `index` behind a typed pointer.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::read_typed`], plus
    /// [`OnTargetError::BufferOverflow`] for out-of-range indexes.
    pub fn read_typed_element(&self, ptr: &TypedPtr, index: u64) -> OnTargetResult<Value>
    {
        let mut core = self.lock_core()?;
        core.check_epoch(ptr.epoch(), ptr.address())?;
        let address = ptr.element(index)?;
        let bytes = core.read_mem_raw(address, ptr.layout().size() as usize)?;
        core.marshaler().decode(&bytes, ptr.layout())
    }

    /// Writes the first element behind a typed pointer.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::read_typed`].
    pub fn write_typed(&self, ptr: &TypedPtr, value: &Value) -> OnTargetResult<()>
    {
        self.write_typed_element(ptr, 0, value)
    }

    /// Writes element `index` behind a typed pointer.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::read_typed_element`].
    pub fn write_typed_element(
        &self,
        ptr: &TypedPtr,
        index: u64,
        value: &Value,
    ) -> OnTargetResult<()>
    {
        let mut core = self.lock_core()?;
        core.check_epoch(ptr.epoch(), ptr.address())?;
        let address = ptr.element(index)?;
        let bytes = core.marshaler().encode(value, ptr.layout())?;
        core.write_mem_raw(address, &bytes)
    }

    /// Carves `bytes` of scratch off the current stack, runs `f`, and
    /// restores the stack pointer. Addresses allocated from the scratch
    /// die when the closure returns.
    ///
    /// The closure receives the session itself, so it can write to and
    /// call functions with the scratch addresses. Synthetic calls made
    /// inside build their frames below the carve-out and leave it intact.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnsupportedOperation`] when the target is not
    /// halted, plus whatever `f` returns.
    pub fn with_stack_scratch<R>(
        &self,
        bytes: u64,
        f: impl FnOnce(&Self, &mut ScratchMem) -> OnTargetResult<R>,
    ) -> OnTargetResult<R>
    {
        let (region, saved_sp, epoch) = {
            let mut core = self.lock_core()?;
            core.expect_halted("with_stack_scratch")?;
            let regs = core.adapter.read_registers()?;
            let saved_sp = regs.sp();
            let carved = u64::from(saved_sp)
                .checked_sub(bytes)
                .map(|sp| sp & !(abi::STACK_ALIGNMENT - 1))
                .ok_or(OnTargetError::OutOfMemory {
                    requested: bytes,
                    available: u64::from(saved_sp),
                })?;
            let mut moved = regs;
            moved.set(CoreRegister::Sp, carved as u32);
            core.adapter.write_registers(&moved)?;
            let region =
                Region { base: Address::new(carved), size: u64::from(saved_sp) - carved };
            trace!(%region, "stack scratch carved");
            (region, saved_sp, core.resume_epoch)
        };

        let mut scratch = ScratchMem::new(region, Some(epoch));
        let result = f(self, &mut scratch);

        let mut core = self.lock_core()?;
        if core.run_state == RunState::Halted
        {
            let mut regs = core.adapter.read_registers()?;
            regs.set(CoreRegister::Sp, saved_sp);
            core.adapter.write_registers(&regs)?;
        }
        else
        {
            warn!("stack scratch released while the target is running; stack pointer not restored");
        }
        result
    }

    /// Calls a firmware function with the default timeout and returns
    /// its result.
    ///
    /// The target may be halted or running; a running target is halted
    /// for the duration and set running again afterwards. Registers and
    /// the interrupted firmware state are fully restored either way, so
    /// the call is invisible to the firmware.
    ///
    /// ## Errors
    ///
    /// - [`OnTargetError::UnknownSymbol`] for unknown functions
    /// - [`OnTargetError::TypeMismatch`] when arguments do not fit the
    ///   function's signature
    /// - [`OnTargetError::Timeout`] when the function does not return in
    ///   time; the target is halted and restored
    /// - [`OnTargetError::UnexpectedHalt`] when the target stops anywhere
    ///   but the return trap, including at armed labels
    /// - [`OnTargetError::SessionBusy`] while another blocking operation
    ///   is in flight
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use ontarget_core::adapter::sim::SimAdapter;
    /// # use ontarget_core::config::TargetConfig;
    /// use ontarget_core::marshal::Value;
    /// # use ontarget_core::session::Session;
    /// # fn main() -> ontarget_core::OnTargetResult<()> {
    /// # let config = TargetConfig::new("sim", "firmware.elf");
    /// # let session = Session::connect_with(Box::new(SimAdapter::new(0x2000_0000, 0x1000)), config)?;
    /// let sum = session.invoke("example_Addition", &[Value::UInt(31), Value::UInt(11)])?;
    /// assert_eq!(sum, Value::UInt(42));
    /// # Ok(())
    /// # }
    /// ```
    pub fn invoke(&self, function: &str, args: &[Value]) -> OnTargetResult<Value>
    {
        self.invoke_with_timeout(function, args, self.inner.default_timeout)
    }

    /// Calls a firmware function with an explicit timeout.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::invoke`].
    pub fn invoke_with_timeout(
        &self,
        function: &str,
        args: &[Value],
        timeout: Duration,
    ) -> OnTargetResult<Value>
    {
        if self.inner.closed.load(Ordering::Acquire)
        {
            return Err(OnTargetError::SessionClosed);
        }
        let _busy = BusyGuard::acquire(&self.inner.busy, "invoke")?;
        let mut core = self.lock_core()?;
        call::invoke(&mut core, &self.inner.closed, function, args, timeout)
    }

    /// Blocks until the firmware reaches a label, resuming it afterwards
    /// so the next hit can arrive. Hits are delivered strictly in order
    /// and never twice; the returned ordinal counts hits of this label
    /// since it was first waited on.
    ///
    /// A label is any function whose address the symbol table knows,
    /// conventionally an empty function the firmware calls to mark a
    /// point of interest.
    ///
    /// ## Errors
    ///
    /// - [`OnTargetError::UnknownSymbol`] for unknown labels
    /// - [`OnTargetError::Timeout`] when no hit arrives in time; the
    ///   target is left running and the label stays armed
    /// - [`OnTargetError::UnexpectedHalt`] when the target stops anywhere
    ///   else
    /// - [`OnTargetError::SessionBusy`] while another blocking operation
    ///   is in flight
    pub fn wait_for_label(
        &self,
        label: &str,
        timeout: Option<Duration>,
    ) -> OnTargetResult<LabelHit>
    {
        self.wait_label(label, false, timeout)
    }

    /// Like [`Session::wait_for_label`], but disarms the label on its
    /// hit and leaves the target halted at it, so the surrounding state
    /// can be inspected.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Session::wait_for_label`].
    pub fn wait_for_label_once(
        &self,
        label: &str,
        timeout: Option<Duration>,
    ) -> OnTargetResult<LabelHit>
    {
        self.wait_label(label, true, timeout)
    }

    fn wait_label(
        &self,
        label: &str,
        one_shot: bool,
        timeout: Option<Duration>,
    ) -> OnTargetResult<LabelHit>
    {
        if self.inner.closed.load(Ordering::Acquire)
        {
            return Err(OnTargetError::SessionClosed);
        }
        let _busy = BusyGuard::acquire(&self.inner.busy, "wait_for_label")?;
        let mut core = self.lock_core()?;
        let limit = timeout.unwrap_or(self.inner.default_timeout);
        rendezvous::wait(&mut core, &self.inner.closed, label, one_shot, limit)
    }

    /// Disarms a label and removes its breakpoint. A no-op for labels
    /// never waited on.
    ///
    /// ## Errors
    ///
    /// Adapter errors while removing the breakpoint.
    pub fn clear_label(&self, label: &str) -> OnTargetResult<()>
    {
        let mut core = self.lock_core()?;
        let Some(record) = core.labels.remove(label)
        else
        {
            return Ok(());
        };
        if let Some(id) = record.breakpoint
        {
            if let Some(bp) = core.breakpoints.remove(id)
            {
                core.adapter.clear_breakpoint(bp.address)?;
            }
        }
        debug!(label, "label cleared");
        Ok(())
    }

    /// Every breakpoint the engine currently has installed.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::SessionClosed`] after disconnect.
    pub fn installed_breakpoints(&self) -> OnTargetResult<Vec<BreakpointRecord>>
    {
        Ok(self.lock_core()?.breakpoints.list().into_iter().cloned().collect())
    }
}

fn attach_locked(core: &mut SessionCore, image: Image, offset: u64) -> Arc<Image>
{
    if image.endianness() != core.config.device_endianness
    {
        warn!(
            image = %image.path().display(),
            image_endianness = %image.endianness(),
            configured = %core.config.device_endianness,
            "image byte order disagrees with the configured device"
        );
    }
    core.symbols.merge(image.symbols(), offset);
    let image = Arc::new(image);
    core.images.push(Arc::clone(&image));
    debug!(
        image = %image.path().display(),
        symbols = image.symbols().len(),
        offset,
        "image attached"
    );
    image
}

fn parse_register(name: &str) -> OnTargetResult<CoreRegister>
{
    name.parse().map_err(|_| OnTargetError::UnknownSymbol { name: name.to_string() })
}

fn teardown(core: &mut SessionCore)
{
    for record in core.breakpoints.drain()
    {
        if let Err(err) = core.adapter.clear_breakpoint(record.address)
        {
            warn!(address = %record.address, %err, "failed to clear breakpoint during teardown");
        }
    }
    core.labels.clear();
    core.allocator.disarm();
    if let Err(err) = core.adapter.disconnect()
    {
        warn!(%err, "adapter disconnect failed");
    }
    core.run_state = RunState::Disconnected;
    info!("session closed");
}

/// Runs the firmware to `location` behind a temporary breakpoint. On
/// timeout the target is halted where it is and the sequence continues,
/// matching how stack claiming behaves on firmware that never reaches
/// the expected location.
fn run_to(
    core: &mut SessionCore,
    closed: &AtomicBool,
    location: &str,
    limit: Duration,
) -> OnTargetResult<()>
{
    let address = core.symbols.resolve(location)?.address;
    core.adapter.set_breakpoint(address)?;
    let id = core.breakpoints.insert(address, true);
    core.resume_flow()?;
    let started = Instant::now();
    let outcome = core.wait_for_stop(closed, started, limit, location);
    if let Some(record) = core.breakpoints.remove(id)
    {
        if let Err(err) = core.adapter.clear_breakpoint(record.address)
        {
            warn!(address = %record.address, %err, "failed to clear arming breakpoint");
        }
    }
    match outcome
    {
        Ok((pc, _)) if pc == address =>
        {
            core.last_stop = None;
            Ok(())
        }
        Ok((pc, reason)) => Err(OnTargetError::UnexpectedHalt {
            pc,
            context: format!(
                "running to {location}: stopped by {reason} at {}",
                core.describe_address(pc)
            ),
        }),
        Err(OnTargetError::Timeout { .. }) =>
        {
            warn!(location, "target did not reach the arming location in time; halting where it is");
            core.halt_now()?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn arm_prestack(
    core: &mut SessionCore,
    closed: &AtomicBool,
    limit: Duration,
) -> OnTargetResult<()>
{
    let alloc_size = u64::from(core.config.on_target_mem_prestack_alloc_size);
    let total = u64::from(core.config.on_target_mem_prestack_total_stack_size);
    let alloc_location = core.config.on_target_mem_prestack_alloc_location.clone();
    let halt_location = core.config.on_target_mem_prestack_halt_location.clone();

    core.ensure_halted()?;
    run_to(core, closed, &alloc_location, limit)?;

    let mut regs = core.adapter.read_registers()?;
    let old_sp = regs.sp();
    let new_sp =
        old_sp.checked_sub(alloc_size as u32).ok_or(OnTargetError::OutOfMemory {
            requested: alloc_size,
            available: u64::from(old_sp),
        })?;
    regs.set(CoreRegister::Sp, new_sp);
    core.adapter.write_registers(&regs)?;
    let region = Region { base: Address::new(u64::from(new_sp)), size: alloc_size };
    core.write_mem_raw(region.base, &vec![0u8; alloc_size as usize])?;
    if total > 0
    {
        debug!(alloc_size, total_stack = total, "claimed scratch from the firmware stack budget");
    }

    run_to(core, closed, &halt_location, limit)?;

    let epoch = core.resume_epoch;
    core.allocator.arm(region, epoch);
    info!(%region, "pre-stack memory armed");
    Ok(())
}

fn arm_testhook(
    core: &mut SessionCore,
    closed: &AtomicBool,
    limit: Duration,
) -> OnTargetResult<()>
{
    let address = core.symbols.resolve(TEST_HOOK_SYMBOL)?.address;
    core.adapter.set_breakpoint(address)?;
    let id = core.breakpoints.insert(address, true);
    if core.run_state == RunState::Halted
    {
        core.resume_flow()?;
    }
    let started = Instant::now();
    let outcome = core.wait_for_stop(closed, started, limit, TEST_HOOK_SYMBOL);
    if let Some(record) = core.breakpoints.remove(id)
    {
        if let Err(err) = core.adapter.clear_breakpoint(record.address)
        {
            warn!(address = %record.address, %err, "failed to clear test hook breakpoint");
        }
    }
    match outcome
    {
        Ok((pc, _)) if pc == address =>
        {
            core.last_stop = None;
            let regs = core.adapter.read_registers()?;
            let base = u64::from(regs.get(CoreRegister::R0));
            let size = u64::from(regs.get(CoreRegister::R1));
            if size == 0
            {
                return Err(OnTargetError::UnsupportedOperation {
                    operation: "arm_memory_model".to_string(),
                    details: format!("{TEST_HOOK_SYMBOL} published an empty buffer"),
                });
            }
            let region = Region { base: Address::new(base), size };
            core.write_mem_raw(region.base, &vec![0u8; size as usize])?;
            let epoch = core.resume_epoch;
            core.allocator.arm(region, epoch);
            info!(%region, "test hook memory armed");
            Ok(())
        }
        Ok((pc, reason)) => Err(OnTargetError::UnexpectedHalt {
            pc,
            context: format!(
                "waiting for the test hook: stopped by {reason} at {}",
                core.describe_address(pc)
            ),
        }),
        Err(err @ OnTargetError::Timeout { .. }) =>
        {
            warn!("firmware never reached the test hook");
            if let Err(halt_err) = core.halt_now()
            {
                warn!(%halt_err, "halt after test hook timeout failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}
