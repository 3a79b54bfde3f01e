/*!
 * Shared Block Traits
 * Abstraction over memory that backs a ring buffer
 */

use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

/// A fixed, 8-byte aligned block of memory that may be shared
///
/// # Safety
///
/// Implementors guarantee that `as_ptr()` stays valid for reads and writes
/// of `len()` bytes for as long as the value lives, that the address does
/// not move, and that it is aligned to at least 8 bytes.
pub unsafe trait SharedBlock: Send + Sync {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Heap-backed block for streams whose peers live in one process
pub struct HeapBlock {
    ptr: NonNull<u8>,
    len: usize,
    _storage: Box<[AtomicU64]>,
}

impl HeapBlock {
    /// Zeroed block of at least `len` bytes
    pub fn new(len: usize) -> Self {
        let words = len.div_ceil(8);
        let storage: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
        let ptr = NonNull::new(storage.as_ptr() as *mut u8).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len: words * 8,
            _storage: storage,
        }
    }
}

// SAFETY: the storage is interior-mutable atomics owned by the block
unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

// SAFETY: the boxed slice never moves and is u64-aligned
unsafe impl SharedBlock for HeapBlock {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_block_rounds_and_aligns() {
        let block = HeapBlock::new(1001);
        assert_eq!(block.len(), 1008);
        assert_eq!(block.as_ptr() as usize % 8, 0);
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), block.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
