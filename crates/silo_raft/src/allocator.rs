//! Size-classed buffer pools for snapshot transfers.
//!
//! Buckets are powers of two from 1 byte to 16 MiB, so allocation waste is
//! bounded at 50%.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Largest allocatable buffer: 16 MiB.
pub const MAX_ALLOC_SIZE: usize = 1 << 24;

const BUCKETS: usize = 25;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("allocation oversize")]
pub struct AllocOversize;

/// Pooled byte-buffer allocator.
#[derive(Debug)]
pub struct BufferAllocator {
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl Default for BufferAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Allocate `size` bytes from the smallest fitting bucket. The returned
    /// buffer's capacity is exactly `2^ceil(log2 size)`.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<AssignedBuffer, AllocOversize> {
        if size == 0 || size > MAX_ALLOC_SIZE {
            return Err(AllocOversize);
        }
        let bits = bucket_bits(size);
        let mut buffer = {
            let mut bucket = self.buckets[bits].lock().expect("allocator lock poisoned");
            bucket.pop().unwrap_or_else(|| vec![0u8; 1 << bits])
        };
        buffer.truncate(size);
        buffer.resize(size, 0);
        Ok(AssignedBuffer {
            buffer,
            written: 0,
            alloc: Some(Arc::clone(self)),
        })
    }

    /// Return a buffer to its bucket. The capacity must be a power of two
    /// within the allocator's range.
    pub fn free(&self, mut buffer: Vec<u8>) -> Result<(), AllocOversize> {
        let cap = buffer.capacity();
        if cap == 0 || cap > MAX_ALLOC_SIZE || !cap.is_power_of_two() {
            return Err(AllocOversize);
        }
        buffer.clear();
        buffer.resize(cap, 0);
        let bits = cap.trailing_zeros() as usize;
        self.buckets[bits]
            .lock()
            .expect("allocator lock poisoned")
            .push(buffer);
        Ok(())
    }
}

fn bucket_bits(size: usize) -> usize {
    size.next_power_of_two().trailing_zeros() as usize
}

/// A buffer leased from a [`BufferAllocator`]; returned to its bucket on
/// [`AssignedBuffer::free`] or drop.
#[derive(Debug)]
pub struct AssignedBuffer {
    buffer: Vec<u8>,
    written: usize,
    alloc: Option<Arc<BufferAllocator>>,
}

impl AssignedBuffer {
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Record `n` more bytes as meaningful.
    pub fn written(&mut self, n: usize) {
        self.written += n;
    }

    /// Meaningful length of the buffer.
    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Hand the buffer back to the allocator.
    pub fn free(mut self) -> Result<(), AllocOversize> {
        self.release()
    }

    fn release(&mut self) -> Result<(), AllocOversize> {
        let Some(alloc) = self.alloc.take() else {
            return Ok(());
        };
        alloc.free(std::mem::take(&mut self.buffer))
    }
}

impl Drop for AssignedBuffer {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_next_power_of_two() {
        let alloc = Arc::new(BufferAllocator::new());
        for size in [1usize, 2, 3, 5, 1000, 4096, 4097, MAX_ALLOC_SIZE] {
            let buffer = alloc.alloc(size).unwrap();
            let expected = size.next_power_of_two();
            assert_eq!(buffer.capacity(), expected, "size {size}");
            assert_eq!(buffer.bytes().len(), size);
            // Waste never exceeds half the bucket.
            assert!(expected < 2 * size || size == 1);
        }
    }

    #[test]
    fn oversize_and_zero_are_rejected() {
        let alloc = Arc::new(BufferAllocator::new());
        assert_eq!(alloc.alloc(0).unwrap_err(), AllocOversize);
        assert_eq!(alloc.alloc(MAX_ALLOC_SIZE + 1).unwrap_err(), AllocOversize);
    }

    #[test]
    fn free_returns_to_same_bucket() {
        let alloc = Arc::new(BufferAllocator::new());
        let buffer = alloc.alloc(3000).unwrap();
        assert_eq!(buffer.capacity(), 4096);
        buffer.free().unwrap();

        // The pooled buffer is reused for the next fitting request.
        let again = alloc.alloc(2049).unwrap();
        assert_eq!(again.capacity(), 4096);
    }

    #[test]
    fn written_tracks_meaningful_length() {
        let alloc = Arc::new(BufferAllocator::new());
        let mut buffer = alloc.alloc(16).unwrap();
        assert!(buffer.is_empty());
        buffer.bytes_mut()[..5].copy_from_slice(b"hello");
        buffer.written(5);
        assert_eq!(buffer.len(), 5);
        assert_eq!(&buffer.bytes()[..5], b"hello");
    }
}
