//! Port allocation for isolated environments.
//!
//! The allocator is the only state shared between workers. It hands out
//! fixed-width slots of host ports; a slot is owned by exactly one live
//! environment until it is released during teardown. Allocation never
//! waits: when every slot is taken the caller gets
//! [`AllocationError::Exhausted`] immediately.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors produced by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("all {slots} port slots are in use")]
    Exhausted { slots: usize },
}

/// Network resources owned by one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSet {
    pub slot: usize,
    /// Host port mapped to the emulator's edge port.
    pub edge_port: u16,
}

impl ResourceSet {
    /// Base URL of the emulator edge endpoint on the local host.
    pub fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.edge_port)
    }
}

/// Mutex-guarded slot allocator.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    stride: u16,
    slots: usize,
    in_use: Mutex<BTreeSet<usize>>,
}

impl PortAllocator {
    pub fn new(base: u16, stride: u16, slots: usize) -> Self {
        Self {
            base,
            stride,
            slots,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    /// Claim the lowest free slot.
    pub fn acquire(&self) -> Result<ResourceSet, AllocationError> {
        let mut in_use = self.lock();
        let slot = (0..self.slots)
            .find(|s| !in_use.contains(s))
            .ok_or(AllocationError::Exhausted { slots: self.slots })?;
        in_use.insert(slot);
        let edge_port = self.base + self.stride * slot as u16;
        debug!(slot, edge_port, "port slot acquired");
        Ok(ResourceSet { slot, edge_port })
    }

    /// Return a slot. Releasing a slot that is not held is logged and ignored.
    pub fn release(&self, resources: &ResourceSet) {
        let mut in_use = self.lock();
        if in_use.remove(&resources.slot) {
            debug!(slot = resources.slot, "port slot released");
        } else {
            warn!(slot = resources.slot, "release of a port slot that was not held");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<usize>> {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_slots_map_to_spaced_ports() {
        let alloc = PortAllocator::new(5100, 10, 3);
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        assert_eq!(a.edge_port, 5100);
        assert_eq!(b.edge_port, 5110);
        assert_eq!(b.endpoint(), "http://localhost:5110");
    }

    #[test]
    fn test_exhaustion_fails_immediately() {
        let alloc = PortAllocator::new(5100, 10, 1);
        let _held = alloc.acquire().unwrap();
        assert_eq!(
            alloc.acquire().unwrap_err(),
            AllocationError::Exhausted { slots: 1 }
        );
    }

    #[test]
    fn test_released_slot_is_reused() {
        let alloc = PortAllocator::new(5100, 10, 2);
        let a = alloc.acquire().unwrap();
        let _b = alloc.acquire().unwrap();
        alloc.release(&a);
        assert_eq!(alloc.in_use(), 1);
        assert_eq!(alloc.acquire().unwrap(), a);
    }

    #[test]
    fn test_double_release_is_harmless() {
        let alloc = PortAllocator::new(5100, 10, 2);
        let a = alloc.acquire().unwrap();
        alloc.release(&a);
        alloc.release(&a);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_overlaps() {
        let alloc = Arc::new(PortAllocator::new(6000, 5, 32));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || alloc.acquire().unwrap())
            })
            .collect();
        let ports: HashSet<u16> = handles
            .into_iter()
            .map(|h| h.join().unwrap().edge_port)
            .collect();
        assert_eq!(ports.len(), 32);
        assert!(alloc.acquire().is_err());
    }
}
