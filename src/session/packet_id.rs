//! Packet identifier allocation
//!
//! Identifiers are non-zero 16-bit values. Allocation walks forward from the
//! last handed-out value, wrapping 65535 -> 1, and skips every identifier that
//! is still reserved.

use super::SessionError;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
    in_use: HashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            in_use: HashSet::new(),
        }
    }

    /// Reserves the next free identifier.
    pub fn allocate(&mut self) -> Result<u16, SessionError> {
        if self.in_use.len() >= usize::from(u16::MAX) {
            return Err(SessionError::PacketIdsExhausted);
        }
        loop {
            let candidate = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if self.in_use.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Reserves a specific identifier; false if it was already taken
    pub fn reserve(&mut self, id: u16) -> bool {
        id != 0 && self.in_use.insert(id)
    }

    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next = 1;
    }
}
