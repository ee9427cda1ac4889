//! # Breakpoint Bookkeeping
//!
//! Tracks which breakpoints the engine has installed on the target and
//! why. The adapter only knows about addresses; this store remembers
//! identity, purpose and hit counts so teardown can remove exactly what
//! the engine added and nothing else.

use std::collections::HashMap;

use crate::types::Address;

/// Unique identity of one installed breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u64);

impl BreakpointId
{
    /// Wraps a raw id value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self
    {
        Self(raw)
    }

    /// The raw id value.
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl std::fmt::Display for BreakpointId
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "bp#{}", self.0)
    }
}

/// One installed breakpoint.
#[derive(Debug, Clone)]
pub struct BreakpointRecord
{
    /// Identity of the breakpoint.
    pub id: BreakpointId,
    /// Instruction address it is installed at.
    pub address: Address,
    /// Whether the engine removes it after the first hit.
    pub temporary: bool,
    /// Number of hits observed so far.
    pub hit_count: u64,
}

/// All breakpoints currently installed by this session.
#[derive(Debug, Default)]
pub struct BreakpointStore
{
    next_id: u64,
    by_id: HashMap<BreakpointId, BreakpointRecord>,
    by_address: HashMap<u64, BreakpointId>,
}

impl BreakpointStore
{
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Records a newly installed breakpoint and returns its identity.
    pub fn insert(&mut self, address: Address, temporary: bool) -> BreakpointId
    {
        self.next_id += 1;
        let id = BreakpointId(self.next_id);
        self.by_id.insert(id, BreakpointRecord { id, address, temporary, hit_count: 0 });
        self.by_address.insert(address.value(), id);
        id
    }

    /// Looks a breakpoint up by identity.
    #[must_use]
    pub fn get(&self, id: BreakpointId) -> Option<&BreakpointRecord>
    {
        self.by_id.get(&id)
    }

    /// Finds the breakpoint installed at an address.
    #[must_use]
    pub fn at(&self, address: Address) -> Option<&BreakpointRecord>
    {
        self.by_address.get(&address.value()).and_then(|id| self.by_id.get(id))
    }

    /// Bumps the hit count of the breakpoint at `address`, returning the
    /// new count.
    pub fn record_hit(&mut self, address: Address) -> Option<u64>
    {
        let id = self.by_address.get(&address.value())?;
        let record = self.by_id.get_mut(id)?;
        record.hit_count += 1;
        Some(record.hit_count)
    }

    /// Forgets a breakpoint, returning its record so the caller can
    /// mirror the removal on the target.
    pub fn remove(&mut self, id: BreakpointId) -> Option<BreakpointRecord>
    {
        let record = self.by_id.remove(&id)?;
        self.by_address.remove(&record.address.value());
        Some(record)
    }

    /// All installed breakpoints, in insertion order of identity.
    #[must_use]
    pub fn list(&self) -> Vec<&BreakpointRecord>
    {
        let mut records: Vec<_> = self.by_id.values().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Empties the store, returning every record for target-side cleanup.
    pub fn drain(&mut self) -> Vec<BreakpointRecord>
    {
        self.by_address.clear();
        let mut records: Vec<_> = self.by_id.drain().map(|(_, record)| record).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Number of installed breakpoints.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.by_id.len()
    }

    /// Returns `true` when nothing is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_insert_lookup_remove()
    {
        let mut store = BreakpointStore::new();
        let id = store.insert(Address::new(0x0800_0100), true);

        let record = store.at(Address::new(0x0800_0100)).unwrap();
        assert_eq!(record.id, id);
        assert!(record.temporary);

        assert_eq!(store.record_hit(Address::new(0x0800_0100)), Some(1));
        assert_eq!(store.record_hit(Address::new(0x0800_0100)), Some(2));
        assert_eq!(store.record_hit(Address::new(0xdead)), None);

        let removed = store.remove(id).unwrap();
        assert_eq!(removed.hit_count, 2);
        assert!(store.is_empty());
        assert!(store.at(Address::new(0x0800_0100)).is_none());
    }

    #[test]
    fn test_drain_returns_everything_in_order()
    {
        let mut store = BreakpointStore::new();
        let first = store.insert(Address::new(0x10), false);
        let second = store.insert(Address::new(0x20), true);

        let drained = store.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, first);
        assert_eq!(drained[1].id, second);
        assert!(store.is_empty());
    }
}
