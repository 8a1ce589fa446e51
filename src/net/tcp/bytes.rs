//! Per-direction byte queues and sequence arithmetic

use alloc::collections::VecDeque;

use crate::error::{Error, Result};

/// `a` comes before `b` in sequence space
///
/// Sequence numbers wrap, so "before" means less than half the space
/// behind.
pub fn seq_lt(a: u32, b: u32) -> bool {
    let distance = b.wrapping_sub(a);
    distance != 0 && distance < 0x8000_0000
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Bytes buffered in one direction of a connection
///
/// `seq` and `ack` are the sequence numbers that go with the queue. For
/// the outbound queue `seq` is the number of the first byte still waiting
/// for an acknowledgement; for the inbound queue it is the next number we
/// expect, and `ack` the last one we acknowledged.
#[derive(Debug)]
pub struct ByteQueue {
    bytes: VecDeque<u8>,
    capacity: usize,
    pub seq: u32,
    pub ack: u32,
}

impl ByteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
            seq: 0,
            ack: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free space
    pub fn room(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// Append as much of `data` as fits; `QueueFull` if nothing does
    pub fn enqueue(&mut self, data: &[u8]) -> Result<usize> {
        let n = data.len().min(self.room());
        if n == 0 && !data.is_empty() {
            return Err(Error::QueueFull);
        }
        self.bytes.extend(&data[..n]);
        Ok(n)
    }

    /// Copy from the front without consuming
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let mut n = 0;
        for (dst, src) in out.iter_mut().zip(self.bytes.iter()) {
            *dst = *src;
            n += 1;
        }
        n
    }

    /// Move bytes from the front into `out`
    pub fn dequeue(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.bytes.drain(..n);
        n
    }

    /// Discard up to `n` bytes from the front; returns how many went
    pub fn drop_front(&mut self, n: usize) -> usize {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n);
        n
    }
}
