//! # Call Engine
//!
//! Executes one firmware function on a halted target and brings back its
//! result, leaving no trace.
//!
//! The sequence: save the full register file, marshal the arguments per
//! the calling convention (registers first, spill to a stack area just
//! below the current stack pointer), point `lr` at a return trap, branch
//! to the function, and resume. When the target stops on the trap the
//! result is read out, the saved registers are written back verbatim, and
//! the firmware is exactly where it was. The trap address is the pre-call
//! program counter, which is known-good code whatever memory model is
//! active.
//!
//! Any other stop is an error: a fault, a stray breakpoint, or an armed
//! label firing mid-call all abort the call with
//! [`OnTargetError::UnexpectedHalt`] after restoring the saved context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::abi::{self, CallPlan, EncodedArg, RetConvention};
use crate::adapter::TargetStatus;
use crate::breakpoints::BreakpointId;
use crate::error::{OnTargetError, OnTargetResult};
use crate::marshal::Value;
use crate::mem::Allocation;
use crate::session::{RunState, SessionCore, POLL_INTERVAL};
use crate::types::{Address, CoreRegister, RegisterFile};

pub(crate) fn invoke(
    core: &mut SessionCore,
    closed: &AtomicBool,
    function: &str,
    args: &[Value],
    limit: Duration,
) -> OnTargetResult<Value>
{
    let signature = core.find_signature(function)?;
    if signature.params.len() != args.len()
    {
        return Err(OnTargetError::TypeMismatch {
            context: format!("call to {function}"),
            expected: format!("{} arguments", signature.params.len()),
            found: format!("{} arguments", args.len()),
        });
    }
    let address = match core.symbols.resolve(function)
    {
        Ok(symbol) => symbol.address,
        Err(err) => signature.address.ok_or(err)?,
    };

    // Marshal before touching the target, so argument errors cost nothing.
    let encoded = {
        let marshaler = core.marshaler();
        let mut encoded = Vec::with_capacity(args.len());
        for (value, layout) in args.iter().zip(&signature.params)
        {
            encoded.push(EncodedArg::new(marshaler.encode(value, layout)?, layout.alignment()));
        }
        encoded
    };
    let mut plan =
        abi::plan_call(&encoded, signature.ret.as_deref(), core.config.device_endianness)?;

    let was_running = core.ensure_halted()?;
    let saved_regs = core.adapter.read_registers()?;
    let saved_stop = core.last_stop.take();

    let mut result_buffer: Option<Allocation> = None;
    if let RetConvention::Indirect { size, alignment } = plan.ret
    {
        let epoch = core.resume_epoch;
        let allocation =
            core.allocator.alloc(size, alignment.max(1), epoch).map_err(|err| match err
            {
                OnTargetError::UnsupportedOperation { .. } => OnTargetError::UnsupportedOperation {
                    operation: format!("call to {function}"),
                    details: format!(
                        "returning {} needs an on-target result buffer and the active memory \
                         model provides none",
                        signature.ret.as_ref().map_or_else(String::new, |l| l.name())
                    ),
                },
                other => other,
            })?;
        plan.reg_words[0] = allocation.address.value() as u32;
        result_buffer = Some(allocation);
    }

    let stack_len = plan.stack.len() as u32;
    let sp_call = saved_regs
        .sp()
        .checked_sub(stack_len)
        .map(|sp| sp & !((abi::STACK_ALIGNMENT as u32) - 1))
        .ok_or(OnTargetError::OutOfMemory {
            requested: u64::from(stack_len),
            available: u64::from(saved_regs.sp()),
        })?;
    if !plan.stack.is_empty()
    {
        core.write_mem_raw(Address::new(u64::from(sp_call)), &plan.stack)?;
    }

    // The pre-call program counter doubles as the return trap.
    let trap = Address::new(u64::from(saved_regs.pc())).code_address();
    let mut regs = saved_regs;
    for (index, word) in plan.reg_words.iter().enumerate()
    {
        regs.set(CoreRegister::ARGUMENT[index], *word);
    }
    regs.set(CoreRegister::Sp, sp_call);
    regs.set(CoreRegister::Lr, abi::link_address(trap.value()));
    regs.set(CoreRegister::Pc, abi::branch_target(address.value()));
    regs.set(CoreRegister::Xpsr, abi::sanitize_xpsr(saved_regs.xpsr()));

    let own_trap = if core.breakpoints.at(trap).is_none()
    {
        core.adapter.set_breakpoint(trap)?;
        Some(core.breakpoints.insert(trap, true))
    }
    else
    {
        None
    };

    if let Err(err) = core.adapter.write_registers(&regs)
    {
        remove_trap(core, own_trap);
        restore_context(core, &saved_regs);
        core.last_stop = saved_stop;
        return Err(err);
    }
    debug!(
        function,
        %address,
        args = args.len(),
        stack_bytes = plan.stack.len(),
        %trap,
        "calling"
    );

    // Raw resume: the resume epoch stays put, because the firmware's own
    // frame (and any test hook buffer above it) is untouched.
    if let Err(err) = core.adapter.resume()
    {
        remove_trap(core, own_trap);
        restore_context(core, &saved_regs);
        core.last_stop = saved_stop;
        return Err(err);
    }
    core.run_state = RunState::Running;

    let started = Instant::now();
    let (stop_pc, stop_reason) = loop
    {
        if closed.load(Ordering::Acquire)
        {
            return Err(OnTargetError::SessionClosed);
        }
        let status = match core.adapter.status()
        {
            Ok(status) => status,
            Err(err) =>
            {
                remove_trap(core, own_trap);
                core.last_stop = saved_stop;
                return Err(err);
            }
        };
        match status
        {
            TargetStatus::Halted { pc, reason } => break (pc, reason),
            TargetStatus::Running =>
            {
                let waited = started.elapsed();
                if waited >= limit
                {
                    warn!(function, ?waited, "call did not return in time");
                    let stuck = match core.adapter.halt()
                    {
                        Ok(()) => core.adapter.read_registers().ok(),
                        Err(err) =>
                        {
                            warn!(%err, "halt after call timeout failed");
                            None
                        }
                    };
                    remove_trap(core, own_trap);
                    restore_context(core, &saved_regs);
                    core.last_stop = saved_stop;
                    let what = match stuck
                    {
                        Some(regs) =>
                        {
                            let pc = Address::new(u64::from(regs.pc())).code_address();
                            format!("call to {function}, stuck at {}", core.describe_address(pc))
                        }
                        None => format!("call to {function}"),
                    };
                    return Err(OnTargetError::Timeout { what, waited, limit });
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };
    core.run_state = RunState::Halted;

    if stop_pc != trap
    {
        remove_trap(core, own_trap);
        let context = match core.labels.name_at(stop_pc)
        {
            Some(label) => format!(
                "label '{label}' fired during a call to {function}; \
                 synchronize on it before invoking"
            ),
            None => format!(
                "call to {function}: stopped by {stop_reason} at {}",
                core.describe_address(stop_pc)
            ),
        };
        restore_context(core, &saved_regs);
        core.last_stop = saved_stop;
        return Err(OnTargetError::UnexpectedHalt { pc: stop_pc, context });
    }

    // Read the result while the callee's effects are still in place,
    // then put every saved register back verbatim.
    let collected = collect_result(core, &plan, result_buffer.as_ref());
    remove_trap(core, own_trap);
    if let Some(allocation) = &result_buffer
    {
        let _ = core.allocator.free(allocation);
    }
    let restore = core.adapter.write_registers(&saved_regs);
    core.last_stop = saved_stop;
    if restore.is_err() && collected.is_err()
    {
        warn!(function, "failed to restore registers after a failed result read");
    }
    let raw = collected?;
    restore?;

    if was_running
    {
        core.resume_flow()?;
    }

    let value = match (raw, signature.ret.as_deref())
    {
        (Some(bytes), Some(layout)) => core.marshaler().decode(&bytes, layout)?,
        _ => Value::Void,
    };
    debug!(function, result = %value, "call returned");
    Ok(value)
}

fn collect_result(
    core: &mut SessionCore,
    plan: &CallPlan,
    buffer: Option<&Allocation>,
) -> OnTargetResult<Option<Vec<u8>>>
{
    match plan.ret
    {
        RetConvention::Void => Ok(None),
        RetConvention::InR0 { .. } | RetConvention::InR0R1 =>
        {
            let regs = core.adapter.read_registers()?;
            Ok(abi::result_bytes(
                plan.ret,
                regs.get(CoreRegister::R0),
                regs.get(CoreRegister::R1),
                core.config.device_endianness,
            ))
        }
        RetConvention::Indirect { size, .. } => match buffer
        {
            Some(allocation) => Ok(Some(core.read_mem_raw(allocation.address, size as usize)?)),
            None => Ok(None),
        },
    }
}

fn remove_trap(core: &mut SessionCore, own: Option<BreakpointId>)
{
    if let Some(id) = own
    {
        if let Some(record) = core.breakpoints.remove(id)
        {
            if let Err(err) = core.adapter.clear_breakpoint(record.address)
            {
                warn!(address = %record.address, %err, "failed to remove the return trap");
            }
        }
    }
}

fn restore_context(core: &mut SessionCore, saved: &RegisterFile)
{
    if let Err(err) = core.adapter.write_registers(saved)
    {
        warn!(%err, "failed to restore registers after a call");
    }
    core.run_state = RunState::Halted;
}
