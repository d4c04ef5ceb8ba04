//! Breakpoint bookkeeping.
//!
//! The remote session patches target memory; this module only tracks ids,
//! states, hit counts and the original instruction byte each software
//! breakpoint replaced. Breakpoints are keyed by address: one address holds
//! at most one breakpoint.

pub mod locator;

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

pub use locator::{BreakpointDiagnostic, BreakpointLocator, BreakpointResolution, DiagnosticSeverity};

use crate::types::Address;

/// x86 `int3`.
pub const TRAP_INSTRUCTION: u8 = 0xCC;

/// Unique identifier for a breakpoint managed by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(u64);

impl BreakpointId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Get the raw numeric representation (useful for logging / errors).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

/// Who owns a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind
{
    /// Set by the user; stays until cleared.
    User,
    /// Set for one stepping operation; removed on the next stop.
    Temporary,
}

/// Whether the trap is in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState
{
    /// `int3` written at the address.
    Armed,
    /// Original byte restored, for example while stepping over it.
    Suspended,
}

/// Public information about a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo
{
    pub id: BreakpointId,
    pub address: Address,
    pub kind: BreakpointKind,
    pub state: BreakpointState,
    /// Number of times the target stopped on it.
    pub hit_count: u64,
    /// Instruction byte the trap replaced.
    pub original_byte: u8,
    pub requested_at: SystemTime,
}

impl BreakpointInfo
{
    #[must_use]
    pub fn is_armed(&self) -> bool
    {
        self.state == BreakpointState::Armed
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool
    {
        self.kind == BreakpointKind::Temporary
    }
}

/// Breakpoint store (the session keeps it behind its state mutex).
#[derive(Debug, Default)]
pub struct BreakpointStore
{
    next_id: u64,
    by_id: BTreeMap<BreakpointId, BreakpointInfo>,
    by_address: HashMap<Address, BreakpointId>,
}

impl BreakpointStore
{
    /// Create a new empty breakpoint store.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    fn allocate_id(&mut self) -> BreakpointId
    {
        self.next_id = self.next_id.wrapping_add(1);
        BreakpointId::from_raw(self.next_id)
    }

    /// Track a newly armed breakpoint.
    ///
    /// If one already exists at `address` its id is returned and nothing
    /// else changes, except that a user request promotes a temporary
    /// breakpoint to a user one so the next stop does not remove it.
    pub fn insert(&mut self, address: Address, kind: BreakpointKind, original_byte: u8) -> BreakpointId
    {
        if let Some(&id) = self.by_address.get(&address) {
            if let Some(info) = self.by_id.get_mut(&id) {
                if kind == BreakpointKind::User {
                    info.kind = BreakpointKind::User;
                }
            }
            return id;
        }

        let id = self.allocate_id();
        self.by_id.insert(
            id,
            BreakpointInfo {
                id,
                address,
                kind,
                state: BreakpointState::Armed,
                hit_count: 0,
                original_byte,
                requested_at: SystemTime::now(),
            },
        );
        self.by_address.insert(address, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: BreakpointId) -> Option<&BreakpointInfo>
    {
        self.by_id.get(&id)
    }

    /// Breakpoint at `address`, if any.
    #[must_use]
    pub fn at(&self, address: Address) -> Option<&BreakpointInfo>
    {
        self.by_address.get(&address).and_then(|id| self.by_id.get(id))
    }

    /// Whether an armed trap sits at `address`.
    #[must_use]
    pub fn is_armed_at(&self, address: Address) -> bool
    {
        self.at(address).is_some_and(BreakpointInfo::is_armed)
    }

    /// Change the state of the breakpoint at `address`.
    pub fn set_state(&mut self, address: Address, state: BreakpointState) -> Option<&BreakpointInfo>
    {
        let id = *self.by_address.get(&address)?;
        let info = self.by_id.get_mut(&id)?;
        info.state = state;
        Some(info)
    }

    /// Replace the byte restored when the breakpoint at `address` is lifted.
    pub fn set_original_byte(&mut self, address: Address, original_byte: u8) -> Option<&BreakpointInfo>
    {
        let id = *self.by_address.get(&address)?;
        let info = self.by_id.get_mut(&id)?;
        info.original_byte = original_byte;
        Some(info)
    }

    /// Remove a breakpoint from the store, returning it if it was present.
    pub fn remove(&mut self, id: BreakpointId) -> Option<BreakpointInfo>
    {
        let info = self.by_id.remove(&id)?;
        self.by_address.remove(&info.address);
        Some(info)
    }

    /// Remove the breakpoint at `address`.
    pub fn remove_at(&mut self, address: Address) -> Option<BreakpointInfo>
    {
        let id = *self.by_address.get(&address)?;
        self.remove(id)
    }

    /// Every breakpoint in id order.
    #[must_use]
    pub fn list(&self) -> Vec<BreakpointInfo>
    {
        self.by_id.values().cloned().collect()
    }

    /// Addresses of all temporary breakpoints.
    #[must_use]
    pub fn temporaries(&self) -> Vec<Address>
    {
        self.by_id
            .values()
            .filter(|info| info.is_temporary())
            .map(|info| info.address)
            .collect()
    }

    /// Record that the target stopped on the trap at `address`. Only armed
    /// breakpoints count.
    pub fn record_hit(&mut self, address: Address) -> Option<BreakpointInfo>
    {
        let id = *self.by_address.get(&address)?;
        let info = self.by_id.get_mut(&id)?;
        if !info.is_armed() {
            return None;
        }
        info.hit_count = info.hit_count.saturating_add(1);
        Some(info.clone())
    }

    /// Remove everything, returning what was tracked.
    pub fn drain(&mut self) -> Vec<BreakpointInfo>
    {
        self.by_address.clear();
        std::mem::take(&mut self.by_id).into_values().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.by_id.len()
    }

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
    fn test_insert_is_idempotent_per_address()
    {
        let mut store = BreakpointStore::new();
        let first = store.insert(Address::new(0x1000), BreakpointKind::User, 0x55);
        let second = store.insert(Address::new(0x1000), BreakpointKind::User, 0xCC);
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.at(Address::new(0x1000)).unwrap().original_byte, 0x55);
    }

    #[test]
    fn test_user_request_promotes_temporary()
    {
        let mut store = BreakpointStore::new();
        store.insert(Address::new(0x2000), BreakpointKind::Temporary, 0x90);
        assert_eq!(store.temporaries(), vec![Address::new(0x2000)]);
        store.insert(Address::new(0x2000), BreakpointKind::User, 0x90);
        assert!(store.temporaries().is_empty());
    }

    #[test]
    fn test_hits_only_count_when_armed()
    {
        let mut store = BreakpointStore::new();
        store.insert(Address::new(0x3000), BreakpointKind::User, 0x90);
        assert_eq!(store.record_hit(Address::new(0x3000)).unwrap().hit_count, 1);
        store.set_state(Address::new(0x3000), BreakpointState::Suspended);
        assert!(store.record_hit(Address::new(0x3000)).is_none());
        assert!(store.record_hit(Address::new(0x3001)).is_none());
    }

    #[test]
    fn test_remove_and_drain()
    {
        let mut store = BreakpointStore::new();
        let id = store.insert(Address::new(0x10), BreakpointKind::User, 1);
        store.insert(Address::new(0x20), BreakpointKind::Temporary, 2);
        assert_eq!(store.remove(id).unwrap().address, Address::new(0x10));
        assert!(store.at(Address::new(0x10)).is_none());
        assert_eq!(store.drain().len(), 1);
        assert!(store.is_empty());
    }
}
