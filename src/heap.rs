//! # Heap Allocator
//!
//! The policy layer tying the block engine, the free list, and the page
//! chunks together: first-fit allocation with splitting, immediate
//! coalescing on free, geometric heap growth, and whole-chunk reclamation.
//!
//! ## How It Works
//!
//! The heap is a set of independent mmap'd chunks. One explicit free list
//! crosses all of them:
//!
//! ```text
//!   HeapAllocator
//!   ┌────────────────┐
//!   │ free_list ─────┼───────────────┐
//!   │ chunk_count: 2 │               ▼
//!   └────────────────┘     (links thread through the
//!                           payloads of free blocks)
//!
//!   chunk 1 (one mapping)
//!   ┌─────┬───┬──────────┬──────┬────────────┬───┐
//!   │ pad │ S │ alloc    │ FREE │ alloc      │ T │
//!   └─────┴───┴──────────┴──────┴────────────┴───┘
//!
//!   chunk 2 (another mapping)
//!   ┌─────┬───┬─────────────────────┬────────┬───┐
//!   │ pad │ S │ alloc               │ FREE   │ T │
//!   └─────┴───┴─────────────────────┴────────┴───┘
//!
//!   S = sentinel, T = terminator
//! ```
//!
//! ### Allocation
//!
//! ```text
//!   request r bytes
//!        │
//!        ▼
//!   need = max(MIN_BLOCK_SIZE, align(r + 2 words))
//!        │
//!        ▼
//!   first-fit walk of the free list ──── hit ────┐
//!        │ miss                                  │
//!        ▼                                       ▼
//!   map a new chunk (geometric size),      split if the remainder can
//!   publish its interior as one big        hold a minimal block, mark
//!   free block, search again               allocated, return payload
//! ```
//!
//! ### Freeing
//!
//! Clearing the allocated bit, then merging with whichever neighbors are
//! free (the sentinel and terminator are permanently allocated, so the
//! neighbor reads are always safe). If the merged block ends up covering an
//! entire chunk and at least one other chunk exists, the whole mapping goes
//! back to the OS. The last chunk is never unmapped; it stays as a warm
//! pool so small alloc/free cycles do not thrash mappings.
//!
//! ### Growth
//!
//! Each new mapping asks for `map_multiplier` pages or whatever the pending
//! request needs, whichever is larger. The multiplier doubles per mapping up
//! to 32 pages and never resets, amortizing syscall cost over the process
//! lifetime and concentrating allocations into fewer chunks.
//!
//! ## Safety
//!
//! This allocator uses **unsafe Rust** extensively because:
//! 1. Direct manipulation of raw pointers and untyped mapped memory
//! 2. System calls to `mmap`/`munmap`
//! 3. Manual memory management without borrow checker guarantees
//!
//! Callers must ensure:
//! - Pointers returned from `allocate` are valid until `deallocate` is called
//! - The same pointer is not deallocated twice
//! - Pointers are not used after deallocation

use std::{cmp, ptr};

use log::debug;

use crate::block::{self, MIN_BLOCK_SIZE, WORD};
use crate::chunk::{self, PAGE_OVERHEAD};
use crate::free_list::FreeList;
use crate::{align, align_to, pager};

/// Mapping growth saturates at this many pages per request.
const MAX_PAGE_PER_MAP: usize = 32;

/// A first-fit boundary-tag allocator over mmap'd page chunks.
///
/// # Fields
///
/// * `free_list` - One explicit free list crossing every chunk
/// * `chunk_count` - Number of live mappings
/// * `map_multiplier` - Pages the next mapping will request at minimum
/// * `page_size` - OS page size, read once at construction
///
/// # Thread Safety
///
/// This allocator is **NOT** thread-safe. For multi-threaded usage,
/// external synchronization (e.g., a `Mutex`) is required. It must also not
/// be re-entered from signal handlers.
pub struct HeapAllocator {
  /// Explicit free list threaded through the payloads of free blocks.
  free_list: FreeList,

  /// Number of live mappings. The last one is never returned to the OS.
  chunk_count: usize,

  /// Geometric growth state. Doubles per mapping up to `MAX_PAGE_PER_MAP`
  /// and never resets, even when chunks are unmapped.
  map_multiplier: usize,

  /// Cached OS page size.
  page_size: usize,
}

impl HeapAllocator {
  /// Creates a new, empty `HeapAllocator`.
  ///
  /// Reads the OS page size and resets the growth state. No memory is
  /// mapped yet; the first allocation triggers the first mapping.
  pub fn new() -> Self {
    Self {
      free_list: FreeList::new(),
      chunk_count: 0,
      map_multiplier: 1,
      page_size: pager::page_size(),
    }
  }

  /// Allocates a block with at least `size` writable payload bytes.
  ///
  /// # Returns
  ///
  /// A 16-byte-aligned pointer to the payload, or null when the OS refuses
  /// to map more memory.
  ///
  /// # Safety
  ///
  /// The caller must ensure no concurrent use of the allocator and must not
  /// touch more than `size` bytes behind the returned pointer.
  pub unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      // Requests beyond isize::MAX can never be mapped; bail before the
      // rounding below could wrap.
      if size > isize::MAX as usize {
        return ptr::null_mut();
      }

      // Payload plus two tags, rounded to the block alignment. Tiny
      // requests are clamped so the block can later hold its list links.
      let need = cmp::max(MIN_BLOCK_SIZE, align!(size + 2 * WORD));

      let mut bp = self.free_list.first_fit(need);
      if bp.is_null() {
        if self.extend(need).is_null() {
          return ptr::null_mut();
        }
        // The fresh chunk's interior is at the head of the list and is
        // large enough by construction.
        bp = self.free_list.first_fit(need);
      }

      self.place(bp, need)
    }
  }

  /// Frees a block previously returned by [`HeapAllocator::allocate`].
  ///
  /// The block is merged with any free neighbor immediately. If the merged
  /// block covers an entire chunk and another chunk exists, the whole
  /// mapping is returned to the OS.
  ///
  /// A null `address` is a no-op, matching C `free()` behavior.
  ///
  /// # Safety
  ///
  /// `address` must have been returned by `allocate` on this allocator and
  /// not freed since. Anything else is undefined behavior; the allocator
  /// does not validate pointers.
  pub unsafe fn deallocate(
    &mut self,
    address: *mut u8,
  ) {
    unsafe {
      if address.is_null() {
        return;
      }

      block::write_tags(address, block::size(address), false);
      let bp = self.coalesce(address);

      // The last chunk stays mapped as a warm pool.
      if self.chunk_count > 1 {
        self.try_release_chunk(bp);
      }
    }
  }

  /// Number of live OS mappings.
  pub fn chunk_count(&self) -> usize {
    self.chunk_count
  }

  /// Cached OS page size.
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Number of blocks currently on the free list.
  pub fn free_block_count(&self) -> usize {
    unsafe { self.free_list.len() }
  }

  /// Size of the largest free block, zero when the heap is fully in use.
  pub fn largest_free_block(&self) -> usize {
    unsafe { self.free_list.largest() }
  }

  /// Prints a one-line heap summary for debugging.
  ///
  /// # Example Output
  ///
  /// ```text
  /// heap: 2 chunks, 3 free blocks, largest free = 8160 bytes, multiplier = 4
  /// ```
  pub fn print_heap(&self) {
    println!(
      "heap: {} chunks, {} free blocks, largest free = {} bytes, multiplier = {}",
      self.chunk_count,
      self.free_block_count(),
      self.largest_free_block(),
      self.map_multiplier,
    );
  }

  /// Carves `need` bytes out of the free block at `bp` and marks the result
  /// allocated. The remainder becomes a new free block when it can still
  /// hold a minimal one; otherwise the whole block is used as is.
  unsafe fn place(
    &mut self,
    bp: *mut u8,
    need: usize,
  ) -> *mut u8 {
    unsafe {
      let total = block::size(bp);
      self.free_list.unlink(bp);

      if total - need >= MIN_BLOCK_SIZE {
        block::write_tags(bp, need, true);

        let rest = bp.add(need);
        block::write_tags(rest, total - need, false);
        self.free_list.insert(rest);
      } else {
        block::write_tags(bp, total, true);
      }

      bp
    }
  }

  /// Merges the just-freed block at `bp` with any free neighbor and leaves
  /// the result on the free list exactly once. Returns the merged block.
  ///
  /// The sentinel and terminator are permanently allocated, so the neighbor
  /// reads never run off the chunk.
  unsafe fn coalesce(
    &mut self,
    bp: *mut u8,
  ) -> *mut u8 {
    unsafe {
      let left = block::prev(bp);
      let right = block::next(bp);

      match (block::allocated(left), block::allocated(right)) {
        // both neighbors live: the block stands alone
        (true, true) => {
          self.free_list.insert(bp);
          bp
        }

        // left neighbor grows over this block; it is already listed
        (false, true) => {
          block::write_tags(left, block::size(left) + block::size(bp), false);
          left
        }

        // this block absorbs its right neighbor
        (true, false) => {
          self.free_list.unlink(right);
          block::write_tags(bp, block::size(bp) + block::size(right), false);
          self.free_list.insert(bp);
          bp
        }

        // left absorbs both this block and the right neighbor
        (false, false) => {
          self.free_list.unlink(right);
          block::write_tags(
            left,
            block::size(left) + block::size(bp) + block::size(right),
            false,
          );
          left
        }
      }
    }
  }

  /// Returns `bp`'s chunk to the OS when the block covers its entire
  /// interior. The block is unlinked before the unmap so the free list
  /// never points into a dead mapping.
  unsafe fn try_release_chunk(
    &mut self,
    bp: *mut u8,
  ) {
    unsafe {
      if !chunk::spans_interior(bp) {
        return;
      }

      let base = chunk::base_of(bp);
      let total = chunk::total_of(bp);

      self.free_list.unlink(bp);
      pager::unmap_pages(base, total);
      self.chunk_count -= 1;

      debug!(
        "released {total} byte chunk at {base:p}, {} chunks live",
        self.chunk_count
      );
    }
  }

  /// Maps a new chunk able to host a block of `need` bytes (tags included),
  /// frames it, and publishes its interior on the free list.
  ///
  /// The mapping size is the larger of what the request demands and the
  /// geometric wish of `map_multiplier` pages. The multiplier advances
  /// before the attempt; a refused mapping leaves it advanced, which only
  /// makes the next ask larger.
  ///
  /// # Returns
  ///
  /// The payload of the new chunk's interior block, or null when the OS
  /// refuses the mapping.
  unsafe fn extend(
    &mut self,
    need: usize,
  ) -> *mut u8 {
    unsafe {
      let required = align_to!(need + PAGE_OVERHEAD, self.page_size);
      let wish = self.map_multiplier * self.page_size;
      let total = cmp::max(required, wish);

      if self.map_multiplier < MAX_PAGE_PER_MAP {
        self.map_multiplier *= 2;
      }

      let base = pager::map_pages(total);
      if base.is_null() {
        debug!("pager refused a {total} byte mapping");
        return ptr::null_mut();
      }

      let bp = chunk::frame(base, total);
      self.free_list.insert(bp);
      self.chunk_count += 1;

      debug!(
        "mapped {total} byte chunk at {base:p}, {} chunks live",
        self.chunk_count
      );

      bp
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Helper: check that a pointer is aligned to `align` bytes.
  fn is_aligned(
    ptr: *mut u8,
    align: usize,
  ) -> bool {
    (ptr as usize) % align == 0
  }

  /// Walks `bp`'s chunk from its sentinel to its terminator checking every
  /// block invariant: matching tags, aligned sizes, no adjacent free
  /// blocks, free-list membership, and interior size conservation.
  unsafe fn verify_chunk(
    heap: &HeapAllocator,
    bp: *mut u8,
  ) {
    unsafe {
      // rewind to the sentinel; it is the only block that reads 2 words
      let mut cur = bp;
      while block::size(cur) != 2 * WORD {
        cur = block::prev(cur);
      }
      let sentinel = cur;
      let base = block::header(sentinel).cast::<u8>().sub(chunk::PAD);

      let mut interior_total = 0usize;
      let mut prev_free = false;

      cur = block::next(sentinel);
      while *block::header(cur) != chunk::TERMINATOR {
        let size = block::size(cur);

        assert_eq!(*block::header(cur), *block::footer(cur));
        assert_eq!(size % crate::align::ALIGNMENT, 0);
        assert!(size >= MIN_BLOCK_SIZE);

        let free = !block::allocated(cur);
        assert!(!(free && prev_free), "adjacent free blocks at {cur:p}");
        assert_eq!(free, heap.free_list.contains(cur));

        prev_free = free;
        interior_total += size;
        cur = block::next(cur);
      }

      // interior sizes account for the whole mapping minus the framing
      let chunk_total = cur as usize - base as usize;
      assert_eq!(interior_total, chunk_total - PAGE_OVERHEAD);
    }
  }

  #[test]
  fn single_small_allocation_round_trip() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let p = heap.allocate(16);
      assert!(!p.is_null());
      assert!(is_aligned(p, 16));
      assert_eq!(heap.chunk_count(), 1);

      heap.deallocate(p);

      // the warm chunk remains, whole again
      assert_eq!(heap.chunk_count(), 1);
      assert_eq!(heap.free_block_count(), 1);
      assert_eq!(heap.largest_free_block(), heap.page_size() - PAGE_OVERHEAD);
    }
  }

  #[test]
  fn basic_allocation_and_write_read() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let p = heap.allocate(8) as *mut u64;
      assert!(!p.is_null());
      *p = 0xDEADBEEFDEADBEEF;

      let count = 8usize;
      let q = heap.allocate(count * 2) as *mut u16;
      assert!(!q.is_null());
      for i in 0..count {
        q.add(i).write((i as u16) + 1);
      }

      // the first allocation was not corrupted by the second
      assert_eq!(*p, 0xDEADBEEFDEADBEEF);
      for i in 0..count {
        assert_eq!((i as u16) + 1, q.add(i).read());
      }

      heap.deallocate(q as *mut u8);
      heap.deallocate(p as *mut u8);
    }
  }

  #[test]
  fn allocations_are_16_aligned() {
    let mut heap = HeapAllocator::new();

    unsafe {
      for size in [0, 1, 7, 8, 15, 16, 17, 100, 1000] {
        let p = heap.allocate(size);
        assert!(!p.is_null());
        assert!(is_aligned(p, 16), "allocate({size}) returned {p:p}");
      }
    }
  }

  #[test]
  fn zero_byte_request_returns_a_real_block() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let p = heap.allocate(0);
      assert!(!p.is_null());
      assert!(is_aligned(p, 16));
      assert_eq!(block::size(p), MIN_BLOCK_SIZE);

      heap.deallocate(p);
      assert_eq!(heap.free_block_count(), 1);
    }
  }

  #[test]
  fn deallocate_null_is_noop() {
    let mut heap = HeapAllocator::new();

    unsafe {
      heap.deallocate(ptr::null_mut());
    }

    assert_eq!(heap.chunk_count(), 0);
    assert_eq!(heap.free_block_count(), 0);
  }

  #[test]
  fn freeing_between_live_neighbors_does_not_coalesce() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let a = heap.allocate(16);
      let b = heap.allocate(16);
      let c = heap.allocate(16);

      heap.deallocate(b);

      // b's neighbors are live, so it stays a lone minimal block next to
      // the chunk's tail block
      assert_eq!(heap.free_block_count(), 2);
      assert!(heap.free_list.contains(b));
      assert_eq!(block::size(b), align!(16 + 2 * WORD));
      verify_chunk(&heap, b);

      heap.deallocate(a);
      heap.deallocate(c);
    }
  }

  #[test]
  fn adjacent_frees_coalesce() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let a = heap.allocate(16);
      let b = heap.allocate(16);

      heap.deallocate(a);
      heap.deallocate(b);

      // a, b, and the chunk tail merged back into one block covering the
      // whole interior; a's block no longer exists on its own
      assert_eq!(heap.free_block_count(), 1);
      assert_eq!(heap.largest_free_block(), heap.page_size() - PAGE_OVERHEAD);
      verify_chunk(&heap, a);
    }
  }

  #[test]
  fn freed_block_is_reused() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let a = heap.allocate(64);
      let b = heap.allocate(64);
      assert!(!a.is_null() && !b.is_null());

      heap.deallocate(a);

      // first fit tries the recycled block before the chunk tail
      let c = heap.allocate(64);
      assert_eq!(a, c);

      heap.deallocate(b);
      heap.deallocate(c);
    }
  }

  #[test]
  fn last_chunk_is_kept_warm() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let p = heap.allocate(heap.page_size() * 10);
      assert!(!p.is_null());
      assert_eq!(heap.chunk_count(), 1);

      heap.deallocate(p);

      // sole chunk, so the big mapping survives as the warm pool
      assert_eq!(heap.chunk_count(), 1);
      assert_eq!(heap.free_block_count(), 1);
    }
  }

  #[test]
  fn whole_chunk_released_when_another_remains() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let small = heap.allocate(16);
      let big = heap.allocate(heap.page_size() * 10);
      assert!(!small.is_null() && !big.is_null());
      assert_eq!(heap.chunk_count(), 2);

      heap.deallocate(big);
      assert_eq!(heap.chunk_count(), 1);

      heap.deallocate(small);
      assert_eq!(heap.chunk_count(), 1);
    }
  }

  #[test]
  fn growth_multiplier_saturates() {
    let mut heap = HeapAllocator::new();

    unsafe {
      for _ in 0..2000 {
        assert!(!heap.allocate(64).is_null());
      }
    }

    // chunk sizes double per mapping, so 2000 live blocks fit in a handful
    // of chunks and the multiplier tops out
    assert_eq!(heap.map_multiplier, MAX_PAGE_PER_MAP);
    assert!(heap.chunk_count() <= 8, "got {} chunks", heap.chunk_count());
  }

  #[test]
  fn impossible_request_fails_cleanly() {
    let mut heap = HeapAllocator::new();

    unsafe {
      assert!(heap.allocate(usize::MAX).is_null());

      // representable but unmappable: the pager refuses it
      assert!(heap.allocate(isize::MAX as usize - 64).is_null());

      // the allocator still works afterwards
      let p = heap.allocate(16);
      assert!(!p.is_null());
      heap.deallocate(p);
    }
  }

  #[test]
  fn heap_invariants_hold_through_a_mixed_workload() {
    let mut heap = HeapAllocator::new();

    unsafe {
      let mut live = Vec::new();
      for i in 0..64usize {
        let size = 16 + (i % 7) * 24;
        let p = heap.allocate(size);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xA5, size);
        live.push(p);
      }

      // free every other block and check the chunk holding a survivor
      for p in live.iter().step_by(2) {
        heap.deallocate(*p);
      }
      verify_chunk(&heap, live[1]);

      for p in live.iter().skip(1).step_by(2) {
        heap.deallocate(*p);
      }

      // everything coalesced chunk by chunk; spare chunks were unmapped
      // as they emptied and only the warm one remains
      assert_eq!(heap.chunk_count(), 1);
      assert_eq!(heap.free_block_count(), 1);
    }
  }
}
