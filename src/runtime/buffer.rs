//! Fixed-capacity receive buffer.
//!
//! Each session owns exactly one buffer, allocated once when the session
//! starts reading and reused for every read afterwards. The buffer never
//! grows: once the write cursor reaches capacity the receive loop stops
//! reading until the contents are handed off and the cursors reset.

use crate::error::SessionError;

/// Byte region with a logical start (`pos`) and a write cursor (`last`).
///
/// Invariant: `pos <= last <= capacity`.
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Box<[u8]>,
    /// Start of unconsumed data.
    pos: usize,
    /// End of received data, where the next read lands.
    last: usize,
}

impl ReceiveBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    ///
    /// Fails with `SessionError::Allocation` rather than aborting when the
    /// allocator cannot satisfy the request.
    pub fn new(capacity: usize) -> Result<Self, SessionError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| SessionError::Allocation {
                what: "receive buffer",
            })?;
        data.resize(capacity, 0);

        Ok(Self {
            data: data.into_boxed_slice(),
            pos: 0,
            last: 0,
        })
    }

    /// Bytes still available for reading into.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.last
    }

    /// True once the write cursor has reached capacity.
    pub fn is_full(&self) -> bool {
        self.last == self.data.len()
    }

    /// Writable tail of the buffer.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.last..]
    }

    /// Record `n` bytes written into the spare region.
    ///
    /// # Panics
    /// Panics if `n` exceeds the remaining capacity (debug builds only).
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining(), "advance past capacity");
        self.last = (self.last + n).min(self.data.len());
    }

    /// Received bytes not yet consumed.
    pub fn filled(&self) -> &[u8] {
        &self.data[self.pos..self.last]
    }

    /// Return both cursors to the start of the region.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.last = 0;
    }
}
