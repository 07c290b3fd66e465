//! Page chunk framing.
//!
//! A chunk is one OS mapping. Before any of it is handed out, the ends are
//! framed so that boundary-tag neighbor arithmetic never runs off the edges:
//!
//! ```text
//!   base                                                       base + total
//!   ▼                                                                     ▼
//!   ┌─────┬──────────┬──────────┬───────────────────────────┬────────────┐
//!   │ pad │ sentinel │ sentinel │      interior blocks      │ terminator │
//!   │ 8 B │  header  │  footer  │                           │   header   │
//!   └─────┴──────────┴──────────┴───────────────────────────┴────────────┘
//!           (2w | 1)   (2w | 1)                                  (w | 1)
//! ```
//!
//! The sentinel is a permanently allocated minimal block; the terminator is
//! a permanently allocated lone header. The first interior block's PREV
//! lookup lands on the sentinel footer and the last one's NEXT lookup lands
//! on the terminator, so coalescing needs no edge cases. The 8 pad bytes put
//! the sentinel payload, and with it every interior payload, on a 16-byte
//! boundary.

use crate::block::{self, WORD};

/// Padding at the base of every chunk.
pub(crate) const PAD: usize = 8;

/// Fixed per-chunk overhead: pad, sentinel header and footer, terminator.
pub(crate) const PAGE_OVERHEAD: usize = PAD + 2 * WORD + WORD;

/// The terminator's full header word. The release probe compares whole
/// words against this; no interior block can collide with it because
/// interior sizes never drop below `MIN_BLOCK_SIZE`.
pub(crate) const TERMINATOR: usize = block::pack(WORD, true);

/// Frames a fresh mapping of `total` bytes and returns the payload of the
/// single free block covering its interior. The block is not yet on any
/// free list.
///
/// # Safety
///
/// `base` must point to at least `total` writable bytes; `total` must leave
/// room for [`PAGE_OVERHEAD`] plus a minimal block.
pub(crate) unsafe fn frame(
  base: *mut u8,
  total: usize,
) -> *mut u8 {
  unsafe {
    let sentinel = base.add(PAD + WORD);
    block::write_tags(sentinel, 2 * WORD, true);

    *(base.add(total - WORD) as *mut usize) = TERMINATOR;

    let bp = sentinel.add(2 * WORD);
    block::write_tags(bp, total - PAGE_OVERHEAD, false);

    bp
  }
}

/// True when the free block at `bp` covers its chunk's entire interior:
/// the sentinel on its left, the terminator on its right.
///
/// # Safety
///
/// `bp` must be the payload of a well-formed block inside a framed chunk.
pub(crate) unsafe fn spans_interior(bp: *mut u8) -> bool {
  unsafe {
    block::size(block::prev(bp)) == 2 * WORD && *block::header(block::next(bp)) == TERMINATOR
  }
}

/// Base address of the chunk whose whole interior `bp` spans.
///
/// # Safety
///
/// Only valid when [`spans_interior`] holds for `bp`.
pub(crate) unsafe fn base_of(bp: *mut u8) -> *mut u8 {
  unsafe { block::header(block::prev(bp)).cast::<u8>().sub(PAD) }
}

/// Total mapped size of the chunk whose whole interior `bp` spans.
///
/// # Safety
///
/// Only valid when [`spans_interior`] holds for `bp`.
pub(crate) unsafe fn total_of(bp: *mut u8) -> usize {
  unsafe { block::size(bp) + PAGE_OVERHEAD }
}
