//! Receive buffer arena.
//!
//! One contiguous allocation is carved into fixed-size slices, one per
//! pooled connection, so the server makes a single allocation for all of its
//! receive buffers at startup instead of one per connection.
//!
//! Slices are handed out with `BytesMut::split_to`: each returned `BytesMut`
//! is a disjoint view of the shared region, owned by exactly one connection
//! and never grown, so no two connections alias the same bytes.

use bytes::BytesMut;
use thiserror::Error;

/// Error returned when the arena cannot hand out another slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// Every slice has been assigned; the arena was sized too small.
    #[error("buffer arena exhausted after {assigned} slices of {slice_size} bytes")]
    Exhausted { assigned: usize, slice_size: usize },
}

/// Single pre-allocated region sliced into per-connection buffers.
pub struct BufferArena {
    /// Unassigned tail of the region.
    region: BytesMut,
    /// Size of each slice.
    slice_size: usize,
    /// Total number of slices the region holds.
    capacity: usize,
    /// Slices handed out so far.
    assigned: usize,
}

impl BufferArena {
    /// Allocate `total_capacity` bytes to be cut into `slice_size` slices.
    ///
    /// # Panics
    /// Panics if `slice_size` is zero.
    pub fn allocate(total_capacity: usize, slice_size: usize) -> Self {
        assert!(slice_size > 0, "arena slice size must be non-zero");
        Self {
            region: BytesMut::zeroed(total_capacity),
            slice_size,
            capacity: total_capacity / slice_size,
            assigned: 0,
        }
    }

    /// Hand out the next unused slice.
    pub fn assign(&mut self) -> Result<BytesMut, ArenaError> {
        if self.region.len() < self.slice_size {
            return Err(ArenaError::Exhausted {
                assigned: self.assigned,
                slice_size: self.slice_size,
            });
        }
        self.assigned += 1;
        Ok(self.region.split_to(self.slice_size))
    }

    /// Get the size of each slice.
    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Get the total number of slices.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of slices not yet assigned.
    pub fn available(&self) -> usize {
        self.capacity - self.assigned
    }
}
