//! The managed heap: a bimodal allocator behind three categorical
//! entry points.
//!
//! Requests at or below [SLAB_SLOT_SIZE] are served from a pre-reserved
//! slab of fixed-size slots guarded by an in-use bitmap; larger
//! requests go to the system allocator.  Workloads here are dominated
//! by many small same-size allocations (stack storage, array element
//! vectors), which hit the predictable fast path.
//!
//! The method-area / stack-area / data-area split is contract only for
//! now: all three are backed by the same implementation, but a future
//! allocator may segregate arenas per collection policy.

use log::{debug, trace};
use thiserror::Error;

/// Slab slot size: a power-of-two multiple of the pointer size.
pub const SLAB_SLOT_SIZE: usize = 64 * std::mem::size_of::<usize>();

/// Number of pre-reserved slab slots.
pub const SLAB_SLOTS: usize = 1024;

/// Which arena a request is charged to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeapCategory {
    MethodArea,
    StackArea,
    DataArea,
}

/// Counters read by diagnostic tooling.
#[derive(Debug, Default, Copy, Clone)]
pub struct HeapStats {
    pub system_allocs: u64,
    pub system_frees: u64,
    pub slab_allocs: u64,
    pub slab_frees: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// The configured heap limit would be exceeded.  The caller is
    /// expected to run the collector once and retry before raising
    /// `OutOfMemoryError`.
    #[error("heap exhausted: {requested} bytes requested, {in_use} of {limit} in use")]
    Exhausted {
        requested: usize,
        in_use: usize,
        limit: usize,
    },
}

#[derive(Debug)]
enum BlockOrigin {
    /// The permanently valid zero-size block.
    Null,
    /// Borrowed from the slab; the payload returns to this slot index.
    Slab(usize),
    System,
}

/// An owning reference to an acquired heap block.
///
/// The null block has no storage and must not be dereferenced; it is
/// what zero-size requests return.
#[derive(Debug)]
pub struct Block {
    data: Box<[u8]>,
    len: usize,
    origin: BlockOrigin,
}

impl Block {
    /// The "no storage" reference.
    pub fn null() -> Block {
        Block {
            data: Box::new([]),
            len: 0,
            origin: BlockOrigin::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.origin, BlockOrigin::Null)
    }

    /// Logical length in bytes (may be less than the physical slab
    /// slot backing it).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Reads a 32-bit stack slot at the given slot index.
    #[inline]
    pub fn get_slot(&self, index: usize) -> i32 {
        let off = index * 4;
        i32::from_ne_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    /// Writes a 32-bit stack slot at the given slot index.
    #[inline]
    pub fn set_slot(&mut self, index: usize, value: i32) {
        let off = index * 4;
        self.data[off..off + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Reads `width` bytes (1, 2, 4 or 8) at a byte offset, zero
    /// extended.  Used by array element storage.
    #[inline]
    pub fn read_n(&self, offset: usize, width: usize) -> u64 {
        let mut v = 0u64;
        for i in 0..width {
            v |= (self.data[offset + i] as u64) << (8 * i);
        }
        v
    }

    /// Writes the low `width` bytes of `value` at a byte offset.
    #[inline]
    pub fn write_n(&mut self, offset: usize, width: usize, value: u64) {
        for i in 0..width {
            self.data[offset + i] = (value >> (8 * i)) as u8;
        }
    }
}

/// The process heap.  Single-threaded internally: each bytecode is
/// atomic with respect to other Java threads, so no locking is needed.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Box<[u8]>>>,
    bitmap: Vec<u64>,
    last_slot: usize,
    limit: usize,
    in_use: usize,
    stats: HeapStats,
}

impl Heap {
    /// Pre-reserves the slab and sets the total byte limit.
    pub fn init(limit: usize) -> Heap {
        debug!(
            "heap init: {} slab slots of {} bytes, limit {} bytes",
            SLAB_SLOTS, SLAB_SLOT_SIZE, limit
        );
        Heap {
            slots: (0..SLAB_SLOTS)
                .map(|_| Some(vec![0u8; SLAB_SLOT_SIZE].into_boxed_slice()))
                .collect(),
            bitmap: vec![0; (SLAB_SLOTS + 63) / 64],
            last_slot: 0,
            limit,
            in_use: 0,
            stats: HeapStats::default(),
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    pub fn acquire_method_area(&mut self, size: usize, clear: bool) -> Result<Block, HeapError> {
        self.acquire(HeapCategory::MethodArea, size, clear)
    }

    pub fn acquire_stack_area(&mut self, size: usize, clear: bool) -> Result<Block, HeapError> {
        self.acquire(HeapCategory::StackArea, size, clear)
    }

    pub fn acquire_data_area(&mut self, size: usize, clear: bool) -> Result<Block, HeapError> {
        self.acquire(HeapCategory::DataArea, size, clear)
    }

    pub fn release_method_area(&mut self, block: Block) {
        self.release(block)
    }

    pub fn release_stack_area(&mut self, block: Block) {
        self.release(block)
    }

    pub fn release_data_area(&mut self, block: Block) {
        self.release(block)
    }

    fn acquire(
        &mut self,
        category: HeapCategory,
        size: usize,
        clear: bool,
    ) -> Result<Block, HeapError> {
        if size == 0 {
            return Ok(Block::null());
        }
        if self.in_use + size > self.limit {
            return Err(HeapError::Exhausted {
                requested: size,
                in_use: self.in_use,
                limit: self.limit,
            });
        }

        if size <= SLAB_SLOT_SIZE {
            if let Some(slot) = self.find_free_slot() {
                self.set_bit(slot, true);
                self.last_slot = slot;
                // the payload box stays parked in the slot vector
                // between loans
                let mut data = self.slots[slot].take().expect("free slab slot has no payload");
                if clear {
                    data.fill(0);
                }
                self.in_use += size;
                self.stats.slab_allocs += 1;
                trace!("acquire {category:?} {size}B from slab slot {slot}");
                return Ok(Block {
                    data,
                    len: size,
                    origin: BlockOrigin::Slab(slot),
                });
            }
            // slab full, fall through to the system allocator
        }

        self.in_use += size;
        self.stats.system_allocs += 1;
        trace!("acquire {category:?} {size}B from system");
        Ok(Block {
            data: vec![0u8; size].into_boxed_slice(),
            len: size,
            origin: BlockOrigin::System,
        })
    }

    fn release(&mut self, block: Block) {
        match block.origin {
            BlockOrigin::Null => {}
            BlockOrigin::Slab(slot) => {
                self.slots[slot] = Some(block.data);
                self.set_bit(slot, false);
                self.in_use -= block.len;
                self.stats.slab_frees += 1;
            }
            BlockOrigin::System => {
                self.in_use -= block.len;
                self.stats.system_frees += 1;
            }
        }
    }

    /// Forward scan from the last-allocated index with wrap-around.
    fn find_free_slot(&self) -> Option<usize> {
        let start = (self.last_slot + 1) % SLAB_SLOTS;
        (0..SLAB_SLOTS)
            .map(|i| (start + i) % SLAB_SLOTS)
            .find(|&slot| !self.get_bit(slot))
    }

    fn get_bit(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set_bit(&mut self, slot: usize, value: bool) {
        if value {
            self.bitmap[slot / 64] |= 1 << (slot % 64);
        } else {
            self.bitmap[slot / 64] &= !(1 << (slot % 64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_request_returns_null_block() {
        let mut heap = Heap::init(1 << 20);
        let block = heap.acquire_data_area(0, true).unwrap();
        assert!(block.is_null());
        assert_eq!(block.len(), 0);
        // releasing the null block is a no-op
        heap.release_data_area(block);
        assert_eq!(heap.stats().slab_frees, 0);
        assert_eq!(heap.stats().system_frees, 0);
    }

    #[test]
    fn small_requests_hit_the_slab() {
        let mut heap = Heap::init(1 << 20);
        let block = heap.acquire_stack_area(64, true).unwrap();
        assert_eq!(heap.stats().slab_allocs, 1);
        assert_eq!(heap.stats().system_allocs, 0);
        heap.release_stack_area(block);
        assert_eq!(heap.stats().slab_frees, 1);
        assert_eq!(heap.bytes_in_use(), 0);
    }

    #[test]
    fn large_requests_hit_the_system_allocator() {
        let mut heap = Heap::init(1 << 24);
        let block = heap.acquire_data_area(SLAB_SLOT_SIZE + 1, true).unwrap();
        assert_eq!(heap.stats().system_allocs, 1);
        assert_eq!(heap.stats().slab_allocs, 0);
        heap.release_data_area(block);
        assert_eq!(heap.stats().system_frees, 1);
    }

    #[test]
    fn slab_overflow_falls_through_to_system() {
        let mut heap = Heap::init(1 << 24);
        let blocks: Vec<_> = (0..SLAB_SLOTS)
            .map(|_| heap.acquire_data_area(16, false).unwrap())
            .collect();
        assert_eq!(heap.stats().slab_allocs, SLAB_SLOTS as u64);

        let spill = heap.acquire_data_area(16, false).unwrap();
        assert_eq!(heap.stats().system_allocs, 1);

        heap.release_data_area(spill);
        for block in blocks {
            heap.release_data_area(block);
        }
        assert_eq!(heap.bytes_in_use(), 0);
    }

    #[test]
    fn freed_slots_are_found_again_after_wrap() {
        let mut heap = Heap::init(1 << 24);
        let mut blocks: Vec<_> = (0..SLAB_SLOTS)
            .map(|_| heap.acquire_data_area(16, false).unwrap())
            .collect();
        // the rotating scan starts at slot 1, so the 4th block holds
        // slot 4
        heap.release_data_area(blocks.remove(3));

        let again = heap.acquire_data_area(16, false).unwrap();
        assert!(matches!(again.origin, BlockOrigin::Slab(4)));
        heap.release_data_area(again);
        for block in blocks {
            heap.release_data_area(block);
        }
    }

    #[test]
    fn all_three_categories_share_one_implementation() {
        let mut heap = Heap::init(1 << 20);
        let m = heap.acquire_method_area(32, true).unwrap();
        let s = heap.acquire_stack_area(32, true).unwrap();
        let d = heap.acquire_data_area(32, true).unwrap();
        assert_eq!(heap.stats().slab_allocs, 3);
        heap.release_method_area(m);
        heap.release_stack_area(s);
        heap.release_data_area(d);
        assert_eq!(heap.stats().slab_frees, 3);
        assert_eq!(heap.bytes_in_use(), 0);
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let mut heap = Heap::init(128);
        let held = heap.acquire_data_area(100, true).unwrap();
        let err = heap.acquire_data_area(100, true).unwrap_err();
        assert!(matches!(err, HeapError::Exhausted { requested: 100, .. }));
        heap.release_data_area(held);
        assert!(heap.acquire_data_area(100, true).is_ok());
    }

    #[test]
    fn slot_accessors_round_trip() {
        let mut heap = Heap::init(1 << 20);
        let mut block = heap.acquire_stack_area(64, true).unwrap();
        block.set_slot(0, -1);
        block.set_slot(15, 0x1234_5678);
        assert_eq!(block.get_slot(0), -1);
        assert_eq!(block.get_slot(15), 0x1234_5678);

        block.write_n(32, 2, 0xBEEF);
        assert_eq!(block.read_n(32, 2), 0xBEEF);
        heap.release_stack_area(block);
    }
}
