use std::io::Read;

use log::{LevelFilter, Log, Metadata, Record};
use tagalloc::HeapAllocator;

/// Minimal stderr logger so the allocator's chunk map/release events are
/// visible while stepping through the demo.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
  fn enabled(
    &self,
    metadata: &Metadata,
  ) -> bool {
    metadata.level() <= LevelFilter::Debug
  }

  fn log(
    &self,
    record: &Record,
  ) {
    if self.enabled(record.metadata()) {
      eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }
  }

  fn flush(&self) {}
}

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`,
/// `htop`, `gdb`, or just visually track how mappings come and go.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn main() {
  log::set_logger(&LOGGER).expect("no other logger is installed");
  log::set_max_level(LevelFilter::Debug);

  // The allocator instance holds the free list head, the live chunk count,
  // and the geometric growth multiplier. Nothing is mapped yet.
  let mut allocator = HeapAllocator::new();

  unsafe {
    println!(
      "[start] PID = {}, page size = {} bytes",
      std::process::id(),
      allocator.page_size()
    );
    allocator.print_heap();
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 1) Allocate space for a u64. The first allocation maps the first
    //    chunk (one page) and carves a minimal block out of it.
    // --------------------------------------------------------------------
    let first_block = allocator.allocate(8);
    println!("\n[1] Allocate 8 bytes -> {first_block:?}");

    let first_ptr = first_block as *mut u64;
    first_ptr.write(0xDEADBEEF);
    println!("[1] Value written to first_block = 0x{:X}", first_ptr.read());
    allocator.print_heap();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 2) Allocate three small blocks and free the middle one. Its
    //    neighbors are live, so it stays a lone free block: watch the free
    //    block count go up by one.
    // --------------------------------------------------------------------
    let a = allocator.allocate(16);
    let b = allocator.allocate(16);
    let c = allocator.allocate(16);
    println!("\n[2] Allocate three 16 byte blocks: {a:?}, {b:?}, {c:?}");

    allocator.deallocate(b);
    println!("[2] Freed the middle block (no coalescing possible)");
    allocator.print_heap();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 3) Free the outer two. Each merges with its free neighbors on the
    //    spot; the free block count drops back down.
    // --------------------------------------------------------------------
    allocator.deallocate(a);
    allocator.deallocate(c);
    println!("\n[3] Freed the outer blocks (both merged with their neighbors)");
    allocator.print_heap();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 4) Allocate ten pages at once. This cannot fit in the warm chunk, so
    //    a second mapping appears (see the log line).
    // --------------------------------------------------------------------
    let big = allocator.allocate(allocator.page_size() * 10);
    println!("\n[4] Allocate 10 pages -> {big:?}");
    allocator.print_heap();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 5) Free the big block. It coalesces into a block spanning its whole
    //    chunk, and since another chunk is still alive, the mapping goes
    //    straight back to the OS.
    // --------------------------------------------------------------------
    allocator.deallocate(big);
    println!("\n[5] Freed the big block (its chunk was unmapped)");
    allocator.print_heap();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 6) Free the very first allocation. The remaining chunk is now empty
    //    but is kept mapped as a warm pool for whatever comes next.
    // --------------------------------------------------------------------
    allocator.deallocate(first_block);
    println!("\n[6] Freed the first block; one warm chunk remains");
    allocator.print_heap();

    println!("\n[7] End of demo. The OS reclaims the warm chunk at process exit.");
  }
}
