//! Cport id allocator.

use std::io::{Error, ErrorKind, Result};

/// Pool of cport ids `0..size`.
///
/// Always hands out the lowest free id of the requested range.
#[derive(Debug, Clone)]
pub struct IdMap {
    size: u16,
    used: Vec<u64>,
    count: usize,
}

impl IdMap {
    /// Creates an empty pool holding ids `0..size`.
    pub fn new(size: u16) -> Self {
        Self { size, used: vec![0; usize::from(size).div_ceil(64)], count: 0 }
    }

    /// Number of ids in the pool.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Number of reserved ids.
    pub fn used(&self) -> usize {
        self.count
    }

    /// Whether `id` is currently reserved.
    pub fn is_used(&self, id: u16) -> bool {
        id < self.size && self.used[usize::from(id) / 64] & Self::bit(id) != 0
    }

    /// Reserves the lowest free id in `start..end`.
    ///
    /// A range of size one requests a specific id.
    pub fn reserve(&mut self, start: u16, end: u16) -> Result<u16> {
        if start >= end || end > self.size {
            return Err(Error::new(ErrorKind::InvalidInput, format!("id range {start}..{end} out of bounds")));
        }

        match (start..end).find(|&id| !self.is_used(id)) {
            Some(id) => {
                self.used[usize::from(id) / 64] |= Self::bit(id);
                self.count += 1;
                Ok(id)
            }
            None if end - start == 1 => Err(Error::new(ErrorKind::AddrInUse, format!("id {start} already in use"))),
            None => Err(Error::new(ErrorKind::AddrNotAvailable, format!("no free id in range {start}..{end}"))),
        }
    }

    /// Returns `id` to the pool.
    pub fn release(&mut self, id: u16) {
        if !self.is_used(id) {
            tracing::warn!("releasing unused id {id}");
            return;
        }

        self.used[usize::from(id) / 64] &= !Self::bit(id);
        self.count -= 1;
    }

    fn bit(id: u16) -> u64 {
        1 << (id % 64)
    }
}
