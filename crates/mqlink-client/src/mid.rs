//! Message id allocation.
//!
//! Message ids are non-zero 16-bit values. An id stays reserved from the
//! moment an operation is issued until its acknowledgment arrives (or, for
//! QoS 0 publishes, until the payload is handed to the transport).

use std::collections::HashSet;

/// Hands out message ids that are not currently in flight.
#[derive(Debug)]
pub struct MidAllocator {
    next: u16,
    in_flight: HashSet<u16>,
}

impl Default for MidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MidAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start allocation at `first` (0 is treated as 1).
    pub fn starting_at(first: u16) -> Self {
        Self {
            next: first.max(1),
            in_flight: HashSet::new(),
        }
    }

    /// Reserve the next free id, or `None` when all 65535 are in flight.
    pub fn allocate(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = if id == u16::MAX { 1 } else { id + 1 };
            if self.in_flight.insert(id) {
                return Some(id);
            }
        }
        None
    }

    /// Release an id. Returns false if it was not in flight.
    pub fn release(&mut self, id: u16) -> bool {
        self.in_flight.remove(&id)
    }

    pub fn is_in_flight(&self, id: u16) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
