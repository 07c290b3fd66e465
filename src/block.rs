//! Boundary-tag block engine.
//!
//! A block is a contiguous span inside a chunk, framed by two identical
//! one-word tags:
//!
//! ```text
//!   ┌──────────────┬───────────────────────────────┬──────────────┐
//!   │    header    │            payload            │    footer    │
//!   │   (1 word)   │        (size − 2 words)       │   (1 word)   │
//!   └──────────────┴───────────────────────────────┴──────────────┘
//!                  ▲
//!                  └── payload pointer (handed to the client)
//! ```
//!
//! Each tag packs the block size with an allocated bit in the low bit.
//! Because the footer of one block sits immediately before the header of the
//! next, both neighbors of any block can be reached in O(1) from its payload
//! pointer alone. Everything in this module operates on payload pointers.

use std::mem;

use crate::align::ALIGNMENT;

/// Machine word size in bytes. Each boundary tag is one word.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// Smallest legal block: header + footer + one alignment unit of payload.
/// The payload of a free block must also fit the two free-list links.
pub(crate) const MIN_BLOCK_SIZE: usize = 2 * WORD + ALIGNMENT;

// The chunk terminator stores a size of one word in its header. Interior
// blocks must always be strictly larger, otherwise the chunk-release probe
// could mistake one for the terminator.
const _: () = assert!(MIN_BLOCK_SIZE > WORD);

/// Packs a block size and its allocated bit into one tag word.
///
/// Sizes are multiples of 16, so the low bit is free to carry the flag.
#[inline]
pub(crate) const fn pack(
  size: usize,
  allocated: bool,
) -> usize {
  size | allocated as usize
}

/// Location of the block's header tag, one word before the payload.
#[inline]
pub(crate) unsafe fn header(bp: *mut u8) -> *mut usize {
  unsafe { bp.sub(WORD) as *mut usize }
}

/// Location of the block's footer tag, the last word of the block.
#[inline]
pub(crate) unsafe fn footer(bp: *mut u8) -> *mut usize {
  unsafe { bp.add(size(bp) - 2 * WORD) as *mut usize }
}

/// Block size as recorded in the header.
///
/// Only the allocated bit is masked off, so the sentinel (2 words) and the
/// terminator (1 word) read back exactly as written.
#[inline]
pub(crate) unsafe fn size(bp: *mut u8) -> usize {
  unsafe { *header(bp) & !1 }
}

/// Allocated bit of the block's header.
#[inline]
pub(crate) unsafe fn allocated(bp: *mut u8) -> bool {
  unsafe { *header(bp) & 1 == 1 }
}

/// Payload address of the block immediately after `bp` in its chunk.
#[inline]
pub(crate) unsafe fn next(bp: *mut u8) -> *mut u8 {
  unsafe { bp.add(size(bp)) }
}

/// Payload address of the block immediately before `bp` in its chunk,
/// reached through the previous block's footer.
#[inline]
pub(crate) unsafe fn prev(bp: *mut u8) -> *mut u8 {
  unsafe {
    let prev_size = *(bp.sub(2 * WORD) as *mut usize) & !1;
    bp.sub(prev_size)
  }
}

/// Writes matching header and footer tags for a block of `size` bytes.
///
/// # Safety
///
/// `bp` must point `WORD` bytes past the start of at least `size` writable
/// bytes; the words under both tags are overwritten.
pub(crate) unsafe fn write_tags(
  bp: *mut u8,
  size: usize,
  allocated: bool,
) {
  unsafe {
    *header(bp) = pack(size, allocated);
    *(bp.add(size - 2 * WORD) as *mut usize) = pack(size, allocated);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Keeps the fake heap 16-aligned so fabricated payloads land where real
  /// ones would.
  #[repr(align(16))]
  struct AlignedBuf([u8; 256]);

  #[test]
  fn tags_and_neighbor_arithmetic() {
    let mut buf = AlignedBuf([0; 256]);

    unsafe {
      let base = buf.0.as_mut_ptr();

      // Three adjacent blocks: 32 allocated, 64 free, 32 allocated.
      let a = base.add(ALIGNMENT);
      write_tags(a, 32, true);
      let b = a.add(32);
      write_tags(b, 64, false);
      let c = b.add(64);
      write_tags(c, 32, true);

      assert_eq!(size(a), 32);
      assert!(allocated(a));
      assert!(!allocated(b));

      assert_eq!(next(a), b);
      assert_eq!(next(b), c);
      assert_eq!(prev(b), a);
      assert_eq!(prev(c), b);

      assert_eq!(*header(b), *footer(b));
      assert_eq!(*header(b), pack(64, false));
    }
  }

  #[test]
  fn resizing_a_block_moves_its_footer() {
    let mut buf = AlignedBuf([0; 256]);

    unsafe {
      let base = buf.0.as_mut_ptr();

      let bp = base.add(ALIGNMENT);
      write_tags(bp, 96, false);
      let old_footer = footer(bp);

      // Shrinking rewrites both tags; the footer follows the new size.
      write_tags(bp, 48, true);
      assert_eq!(size(bp), 48);
      assert!(allocated(bp));
      assert_eq!(*header(bp), *footer(bp));
      assert_ne!(footer(bp), old_footer);
    }
  }

  #[test]
  fn min_block_payload_fits_the_free_list_links() {
    assert!(MIN_BLOCK_SIZE - 2 * WORD >= mem::size_of::<crate::free_list::Node>());
  }
}
