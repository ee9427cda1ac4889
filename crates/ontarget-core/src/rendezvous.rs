//! # Label Rendezvous
//!
//! Host/firmware synchronization on named code locations. A label is any
//! function the symbol table can resolve, conventionally an empty one the
//! firmware calls to mark "I got here". Waiting on a label arms a
//! breakpoint at it and runs the firmware until it arrives.
//!
//! Hits are delivered strictly in arrival order and never twice. When the
//! firmware reaches some other armed label while a wait is in progress,
//! that hit is recorded and handed to that label's next waiter instead of
//! being dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::adapter::{HaltReason, TargetStatus};
use crate::breakpoints::BreakpointId;
use crate::error::{OnTargetError, OnTargetResult};
use crate::session::{RunState, SessionCore, POLL_INTERVAL};
use crate::types::Address;

/// One observed arrival at a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelHit
{
    /// The label's name.
    pub name: String,
    /// 1-based count of hits of this label delivered so far.
    pub ordinal: u64,
    /// The label's address.
    pub address: Address,
}

impl std::fmt::Display for LabelHit
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{} (hit {})", self.name, self.ordinal)
    }
}

/// Book-keeping for one armed label.
#[derive(Debug)]
pub(crate) struct LabelRecord
{
    pub(crate) address: Address,
    pub(crate) breakpoint: Option<BreakpointId>,
    /// Hits delivered to a caller so far.
    pub(crate) observed: u64,
    /// Hits seen while another wait was polling, not yet delivered.
    pub(crate) pending: u64,
}

/// Every label this session has waited on.
#[derive(Debug, Default)]
pub(crate) struct LabelBook
{
    labels: HashMap<String, LabelRecord>,
}

impl LabelBook
{
    pub(crate) fn ensure(&mut self, name: &str, address: Address) -> &mut LabelRecord
    {
        self.labels.entry(name.to_string()).or_insert_with(|| LabelRecord {
            address,
            breakpoint: None,
            observed: 0,
            pending: 0,
        })
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut LabelRecord>
    {
        self.labels.get_mut(name)
    }

    /// The armed label at `address`, when there is one.
    pub(crate) fn name_at(&self, address: Address) -> Option<String>
    {
        self.labels
            .iter()
            .find_map(|(name, record)| (record.address == address).then(|| name.clone()))
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<LabelRecord>
    {
        self.labels.remove(name)
    }

    pub(crate) fn clear(&mut self)
    {
        self.labels.clear();
    }
}

/// Blocks until the firmware arrives at `name`, arming it first when
/// needed. `one_shot` disarms the label on delivery and leaves the
/// target halted at it; otherwise the target is resumed so the next hit
/// can arrive.
pub(crate) fn wait(
    core: &mut SessionCore,
    closed: &AtomicBool,
    name: &str,
    one_shot: bool,
    limit: Duration,
) -> OnTargetResult<LabelHit>
{
    let address = core.symbols.resolve(name)?.address;

    // A hit recorded while an earlier wait was polling is delivered
    // first, preserving arrival order.
    {
        let record = core.labels.ensure(name, address);
        if record.pending > 0
        {
            record.pending -= 1;
            record.observed += 1;
            let ordinal = record.observed;
            trace!(label = name, ordinal, "delivering a recorded hit");
            return Ok(LabelHit { name: name.to_string(), ordinal, address });
        }
    }

    // An undelivered breakpoint stop already sitting at the label.
    if core.run_state == RunState::Halted
        && core.last_stop == Some((address, HaltReason::Breakpoint))
    {
        core.last_stop = None;
        return deliver(core, name, address, one_shot);
    }

    let needs_arm = core.labels.ensure(name, address).breakpoint.is_none();
    if needs_arm
    {
        core.adapter.set_breakpoint(address)?;
        let id = core.breakpoints.insert(address, one_shot);
        if let Some(record) = core.labels.get_mut(name)
        {
            record.breakpoint = Some(id);
        }
        debug!(label = name, %address, "label armed");
    }
    if core.run_state == RunState::Halted
    {
        core.resume_flow()?;
    }

    let started = Instant::now();
    loop
    {
        if closed.load(Ordering::Acquire)
        {
            return Err(OnTargetError::SessionClosed);
        }
        match core.adapter.status()?
        {
            TargetStatus::Halted { pc, reason } =>
            {
                core.run_state = RunState::Halted;
                core.last_stop = None;
                if pc == address
                {
                    return deliver(core, name, address, one_shot);
                }
                if let Some(other) = core.labels.name_at(pc)
                {
                    // A different armed label fired first. Record the hit
                    // for its next waiter and keep going.
                    core.breakpoints.record_hit(pc);
                    if let Some(record) = core.labels.get_mut(&other)
                    {
                        record.pending += 1;
                    }
                    trace!(label = %other, "recorded a hit for another label");
                    core.resume_flow()?;
                    continue;
                }
                core.last_stop = Some((pc, reason));
                return Err(OnTargetError::UnexpectedHalt {
                    pc,
                    context: format!(
                        "waiting for label '{name}': stopped by {reason} at {}",
                        core.describe_address(pc)
                    ),
                });
            }
            TargetStatus::Running =>
            {
                let waited = started.elapsed();
                if waited >= limit
                {
                    debug!(label = name, ?waited, "no label hit before the deadline");
                    return Err(OnTargetError::Timeout {
                        what: format!("label '{name}'"),
                        waited,
                        limit,
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn deliver(
    core: &mut SessionCore,
    name: &str,
    address: Address,
    one_shot: bool,
) -> OnTargetResult<LabelHit>
{
    core.breakpoints.record_hit(address);
    let ordinal = {
        let record = core.labels.ensure(name, address);
        record.observed += 1;
        record.observed
    };
    if one_shot
    {
        disarm(core, name);
        debug!(label = name, ordinal, "label hit; leaving the target halted");
    }
    else
    {
        core.resume_flow()?;
        debug!(label = name, ordinal, "label hit; target resumed");
    }
    Ok(LabelHit { name: name.to_string(), ordinal, address })
}

fn disarm(core: &mut SessionCore, name: &str)
{
    let Some(record) = core.labels.get_mut(name)
    else
    {
        return;
    };
    let Some(id) = record.breakpoint.take()
    else
    {
        return;
    };
    if let Some(bp) = core.breakpoints.remove(id)
    {
        if let Err(err) = core.adapter.clear_breakpoint(bp.address)
        {
            warn!(address = %bp.address, %err, "failed to clear a label breakpoint");
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_label_book_records_and_finds()
    {
        let mut book = LabelBook::default();
        let address = Address::new(0x0800_0800);
        book.ensure("run_loop", address).pending += 1;

        assert_eq!(book.name_at(address), Some("run_loop".to_string()));
        assert_eq!(book.name_at(Address::new(0xdead)), None);

        let record = book.get_mut("run_loop").unwrap();
        assert_eq!(record.pending, 1);
        assert!(record.breakpoint.is_none());

        assert!(book.remove("run_loop").is_some());
        assert!(book.remove("run_loop").is_none());
    }
}
