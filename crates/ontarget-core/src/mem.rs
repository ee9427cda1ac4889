//! # On-Target Memory
//!
//! Host-driven allocation of scratch memory on the target, used to place
//! argument data (strings, arrays, structs passed by pointer) where the
//! firmware can see it.
//!
//! Three strategies exist behind one interface, selected by
//! configuration:
//!
//! - [`MemModel::NoAlloc`]: no allocation at all. Every alloc fails, so
//!   tests restricted to register-sized arguments still run against
//!   firmware that provides no cooperation.
//! - [`MemModel::TestHook`]: the firmware's test hook publishes a buffer
//!   from its own stack frame. Allocations are only valid while the
//!   target stays halted inside the hook; resuming invalidates them.
//! - [`MemModel::PreStack`]: a slice is carved off the top of the
//!   firmware stack before `main` runs, by moving the stack pointer
//!   during startup. Allocations live for the whole session.
//!
//! All strategies are bump allocators. `free` is accepted for symmetry
//! but space only comes back through `reset`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{OnTargetError, OnTargetResult};
use crate::symbols::TypeLayout;
use crate::types::Address;

/// Default allocation alignment, one machine word.
pub const ALIGN_DEFAULT: u64 = 4;

/// On-target memory strategy. Values match the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemModel
{
    /// No on-target allocation available.
    #[serde(rename = "NOALLOC")]
    NoAlloc,
    /// Buffer published by the firmware's test hook.
    #[default]
    #[serde(rename = "TESTHOOK")]
    TestHook,
    /// Region carved from the firmware stack at startup.
    #[serde(rename = "PRESTACK")]
    PreStack,
}

impl std::fmt::Display for MemModel
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Self::NoAlloc => write!(f, "NOALLOC"),
            Self::TestHook => write!(f, "TESTHOOK"),
            Self::PreStack => write!(f, "PRESTACK"),
        }
    }
}

/// A contiguous span of target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region
{
    /// First address of the region.
    pub base: Address,
    /// Length in bytes.
    pub size: u64,
}

impl Region
{
    /// One past the last address.
    #[must_use]
    pub fn end(&self) -> Address
    {
        self.base + self.size
    }

    /// Returns `true` if `address` lies inside the region.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address < self.end()
    }
}

impl std::fmt::Display for Region
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "[{}, {})", self.base, self.end())
    }
}

/// One allocation handed out by the [`Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation
{
    /// Target address of the allocation.
    pub address: Address,
    /// Size in bytes.
    pub size: u64,
    /// Target run the allocation belongs to, for strategies whose memory
    /// dies when the target resumes. `None` means run-independent.
    pub epoch: Option<u64>,
}

/// Bump allocator over whichever region the active strategy provides.
#[derive(Debug)]
pub struct Allocator
{
    model: MemModel,
    region: Option<Region>,
    cursor: u64,
    armed_epoch: Option<u64>,
}

impl Allocator
{
    /// Creates an allocator for the configured strategy. It starts
    /// unarmed; [`Allocator::arm`] supplies the region once the target
    /// side has been set up.
    #[must_use]
    pub const fn new(model: MemModel) -> Self
    {
        Self { model, region: None, cursor: 0, armed_epoch: None }
    }

    /// The configured strategy.
    #[must_use]
    pub const fn model(&self) -> MemModel
    {
        self.model
    }

    /// Supplies the backing region. For [`MemModel::TestHook`] the epoch
    /// records which target run the region belongs to.
    pub fn arm(&mut self, region: Region, epoch: u64)
    {
        debug!(model = %self.model, %region, epoch, "armed on-target allocator");
        self.region = Some(region);
        self.cursor = 0;
        self.armed_epoch = Some(epoch);
    }

    /// Drops the backing region, failing subsequent allocations.
    pub fn disarm(&mut self)
    {
        self.region = None;
        self.cursor = 0;
        self.armed_epoch = None;
    }

    /// The backing region, when armed.
    #[must_use]
    pub const fn region(&self) -> Option<Region>
    {
        self.region
    }

    /// Bytes handed out since the last reset.
    #[must_use]
    pub const fn used(&self) -> u64
    {
        self.cursor
    }

    /// Allocates `size` bytes at the given power-of-two alignment.
    ///
    /// `current_epoch` is the session's resume counter; under
    /// [`MemModel::TestHook`] it must still match the epoch the allocator
    /// was armed in.
    ///
    /// ## Errors
    ///
    /// - [`OnTargetError::UnsupportedOperation`] under `NOALLOC`, or when
    ///   the strategy has not been armed, or when the test-hook frame is
    ///   gone
    /// - [`OnTargetError::InvalidAlignment`] for non-power-of-two
    ///   alignments
    /// - [`OnTargetError::OutOfMemory`] when the region is exhausted
    pub fn alloc(
        &mut self,
        size: u64,
        align: u64,
        current_epoch: u64,
    ) -> OnTargetResult<Allocation>
    {
        if self.model == MemModel::NoAlloc
        {
            return Err(OnTargetError::UnsupportedOperation {
                operation: "alloc".to_string(),
                details: "memory model NOALLOC provides no on-target memory".to_string(),
            });
        }
        if !align.is_power_of_two()
        {
            return Err(OnTargetError::InvalidAlignment {
                context: "on-target allocation".to_string(),
                align,
            });
        }
        let Some(region) = self.region
        else
        {
            return Err(OnTargetError::UnsupportedOperation {
                operation: "alloc".to_string(),
                details: format!("memory model {} is not armed yet", self.model),
            });
        };
        if self.model == MemModel::TestHook && self.armed_epoch != Some(current_epoch)
        {
            return Err(OnTargetError::UnsupportedOperation {
                operation: "alloc".to_string(),
                details: "the test hook frame is gone; the target has resumed since it was armed"
                    .to_string(),
            });
        }

        let unaligned = region.base + self.cursor;
        let delta = (align - unaligned.value() % align) % align;
        let available = region.size.saturating_sub(self.cursor + delta);
        if size > available
        {
            return Err(OnTargetError::OutOfMemory { requested: size, available });
        }
        let address = unaligned + delta;
        self.cursor += delta + size;
        trace!(%address, size, align, used = self.cursor, "on-target alloc");
        Ok(Allocation { address, size, epoch: self.epoch_tag() })
    }

    /// Accepts an allocation back. Space is only actually reclaimed by
    /// [`Allocator::reset`]; this exists so call sites can record intent.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::UnsupportedOperation`] under `NOALLOC`.
    pub fn free(&mut self, allocation: &Allocation) -> OnTargetResult<()>
    {
        if self.model == MemModel::NoAlloc
        {
            return Err(OnTargetError::UnsupportedOperation {
                operation: "free".to_string(),
                details: "memory model NOALLOC provides no on-target memory".to_string(),
            });
        }
        trace!(address = %allocation.address, size = allocation.size, "freed (reclaim at reset)");
        Ok(())
    }

    /// Releases every allocation at once by rewinding the bump cursor.
    /// A no-op under `NOALLOC`.
    pub fn reset(&mut self)
    {
        self.cursor = 0;
    }

    /// Returns `true` when an allocation from an earlier target run is no
    /// longer safe to touch.
    #[must_use]
    pub fn is_stale(&self, allocation: &Allocation, current_epoch: u64) -> bool
    {
        allocation.epoch.is_some_and(|epoch| epoch != current_epoch)
    }

    fn epoch_tag(&self) -> Option<u64>
    {
        match self.model
        {
            MemModel::TestHook => self.armed_epoch,
            _ => None,
        }
    }
}

/// A typed view of an on-target allocation: an address plus the layout
/// of the elements stored there.
#[derive(Debug, Clone)]
pub struct TypedPtr
{
    address: Address,
    layout: Arc<TypeLayout>,
    count: u64,
    epoch: Option<u64>,
}

impl TypedPtr
{
    pub(crate) const fn new(
        address: Address,
        layout: Arc<TypeLayout>,
        count: u64,
        epoch: Option<u64>,
    ) -> Self
    {
        Self { address, layout, count, epoch }
    }

    /// Target address of the first element.
    #[must_use]
    pub const fn address(&self) -> Address
    {
        self.address
    }

    /// Layout of one element.
    #[must_use]
    pub fn layout(&self) -> &Arc<TypeLayout>
    {
        &self.layout
    }

    /// Number of elements.
    #[must_use]
    pub const fn count(&self) -> u64
    {
        self.count
    }

    /// Total size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64
    {
        self.layout.size() * self.count
    }

    /// Address of element `index`.
    ///
    /// ## Errors
    ///
    /// Returns [`OnTargetError::BufferOverflow`] for out-of-range indexes.
    pub fn element(&self, index: u64) -> OnTargetResult<Address>
    {
        if index >= self.count
        {
            return Err(OnTargetError::BufferOverflow {
                context: format!("index {index} into {}[{}]", self.layout.name(), self.count),
                capacity: self.count as usize,
                required: index as usize + 1,
            });
        }
        Ok(self.address + index * self.layout.size())
    }

    pub(crate) const fn epoch(&self) -> Option<u64>
    {
        self.epoch
    }

    /// A pointer-valued view of this allocation, for passing as a call
    /// argument.
    #[must_use]
    pub const fn as_value(&self) -> crate::marshal::Value
    {
        crate::marshal::Value::Pointer(self.address)
    }
}

/// Bump allocation inside a temporary stack carve-out. Handed to the
/// closure of [`Session::with_stack_scratch`]; every address it returns
/// dies when the closure ends and the stack pointer is restored.
///
/// [`Session::with_stack_scratch`]: crate::session::Session::with_stack_scratch
#[derive(Debug)]
pub struct ScratchMem
{
    region: Region,
    cursor: u64,
    epoch: Option<u64>,
}

impl ScratchMem
{
    pub(crate) const fn new(region: Region, epoch: Option<u64>) -> Self
    {
        Self { region, cursor: 0, epoch }
    }

    /// The carved-out region.
    #[must_use]
    pub const fn region(&self) -> Region
    {
        self.region
    }

    /// Allocates `size` bytes at the given power-of-two alignment.
    ///
    /// ## Errors
    ///
    /// [`OnTargetError::InvalidAlignment`] or [`OnTargetError::OutOfMemory`].
    pub fn alloc(&mut self, size: u64, align: u64) -> OnTargetResult<Address>
    {
        if !align.is_power_of_two()
        {
            return Err(OnTargetError::InvalidAlignment {
                context: "stack scratch allocation".to_string(),
                align,
            });
        }
        let unaligned = self.region.base + self.cursor;
        let delta = (align - unaligned.value() % align) % align;
        let available = self.region.size.saturating_sub(self.cursor + delta);
        if size > available
        {
            return Err(OnTargetError::OutOfMemory { requested: size, available });
        }
        let address = unaligned + delta;
        self.cursor += delta + size;
        Ok(address)
    }

    /// Allocates room for `count` values of `layout` at the type's
    /// natural alignment.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`ScratchMem::alloc`].
    pub fn alloc_typed(
        &mut self,
        layout: Arc<TypeLayout>,
        count: u64,
    ) -> OnTargetResult<TypedPtr>
    {
        let address = self.alloc(layout.size() * count, layout.alignment().max(1))?;
        Ok(TypedPtr::new(address, layout, count, self.epoch))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn armed(model: MemModel) -> Allocator
    {
        let mut allocator = Allocator::new(model);
        allocator.arm(Region { base: Address::new(0x2000_0100), size: 64 }, 1);
        allocator
    }

    #[test]
    fn test_noalloc_refuses_everything_but_reset()
    {
        let mut allocator = Allocator::new(MemModel::NoAlloc);
        match allocator.alloc(4, 4, 0)
        {
            Err(OnTargetError::UnsupportedOperation { operation, .. }) =>
            {
                assert_eq!(operation, "alloc")
            }
            other => panic!("Expected UnsupportedOperation, got {other:?}"),
        }
        allocator.reset();
    }

    #[test]
    fn test_bump_respects_natural_alignment()
    {
        let mut allocator = armed(MemModel::PreStack);
        let a = allocator.alloc(1, 1, 1).unwrap();
        let b = allocator.alloc(4, 4, 1).unwrap();
        assert_eq!(a.address.value(), 0x2000_0100);
        assert_eq!(b.address.value(), 0x2000_0104);
        assert_eq!(allocator.used(), 8);
    }

    #[test]
    fn test_non_power_of_two_alignment_is_rejected()
    {
        let mut allocator = armed(MemModel::PreStack);
        match allocator.alloc(4, 3, 1)
        {
            Err(OnTargetError::InvalidAlignment { align: 3, .. }) => {}
            other => panic!("Expected InvalidAlignment, got {other:?}"),
        }
    }

    #[test]
    fn test_exhaustion_is_a_hard_error()
    {
        let mut allocator = armed(MemModel::PreStack);
        allocator.alloc(48, 4, 1).unwrap();
        match allocator.alloc(20, 4, 1)
        {
            Err(OnTargetError::OutOfMemory { requested: 20, available: 16 }) => {}
            other => panic!("Expected OutOfMemory, got {other:?}"),
        }
        // Still exhausted until reset; no implicit growth or retry.
        allocator.alloc(16, 4, 1).unwrap();
        allocator.reset();
        assert_eq!(allocator.used(), 0);
    }

    #[test]
    fn test_testhook_allocations_die_on_resume()
    {
        let mut allocator = armed(MemModel::TestHook);
        let alive = allocator.alloc(4, 4, 1).unwrap();
        assert!(!allocator.is_stale(&alive, 1));
        assert!(allocator.is_stale(&alive, 2));
        match allocator.alloc(4, 4, 2)
        {
            Err(OnTargetError::UnsupportedOperation { .. }) => {}
            other => panic!("Expected UnsupportedOperation, got {other:?}"),
        }
    }

    #[test]
    fn test_prestack_allocations_survive_resume()
    {
        let mut allocator = armed(MemModel::PreStack);
        let allocation = allocator.alloc(4, 4, 1).unwrap();
        assert_eq!(allocation.epoch, None);
        assert!(!allocator.is_stale(&allocation, 99));
    }
}
