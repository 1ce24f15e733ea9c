//! Metadata written at the aligned base of every block and big mapping.
//!
//! Blocks and big mappings are both aligned to the block size, so any pointer
//! handed out by the allocator finds its header by masking off the low bits.
//! For big allocations the header also sits exactly [`HEADER_SIZE`] bytes
//! before the returned pointer.

use core::{mem::size_of, ptr::NonNull};

pub const HEADER_SIZE: usize = size_of::<Header>();
/// Magic number to identify valid headers.
pub const HEADER_MAGIC: u64 = 0x5445_5353_4552_4121; // "TESSERA!"

const _: () = assert!(HEADER_SIZE == 64);

/// `Kind` determines how a pointer is released.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
  /// Slot inside a block.
  Small = 0,
  /// Dedicated mapping.
  Big = 1,
}

#[repr(C, align(64))]
#[derive(Clone, Copy, Debug)]
pub struct Header {
  pub magic: u64,
  /// Id of the allocator that wrote the header.
  pub owner: u64,
  /// Big: total mapped bytes, header included.
  pub mapped: usize,
  /// Big: size the caller asked for.
  pub requested: usize,
  /// Small: arena index inside the owner's pool.
  pub arena: u32,
  /// Small: block id inside the arena.
  pub block: u32,
  pub kind: Kind,
  /// Small: size class index.
  pub class: u8,
}

impl Header {
  pub const fn small(owner: u64, arena: u32, block: u32, class: u8) -> Self {
    Self {
      magic: HEADER_MAGIC,
      owner,
      mapped: 0,
      requested: 0,
      arena,
      block,
      kind: Kind::Small,
      class,
    }
  }

  pub const fn big(owner: u64, mapped: usize, requested: usize) -> Self {
    Self {
      magic: HEADER_MAGIC,
      owner,
      mapped,
      requested,
      arena: 0,
      block: 0,
      kind: Kind::Big,
      class: 0,
    }
  }

  #[inline]
  pub fn is_valid(&self) -> bool {
    self.magic == HEADER_MAGIC
  }
}

/// Aligned base that holds the header for `ptr`.
#[inline(always)]
pub fn base_of(ptr: NonNull<u8>, block_size: usize) -> *mut Header {
  debug_assert!(block_size.is_power_of_two());
  ptr.as_ptr().map_addr(|addr| addr & !(block_size - 1)).cast()
}

/// Copies the header that governs `ptr`.
///
/// # Safety
/// `ptr` must be a live pointer returned by an allocator using `block_size`.
#[inline]
pub unsafe fn read(ptr: NonNull<u8>, block_size: usize) -> Header {
  unsafe { base_of(ptr, block_size).read() }
}

/// # Safety
/// `base` must be the aligned, writable start of a block or big mapping.
#[inline]
pub unsafe fn write(base: NonNull<u8>, header: Header) {
  unsafe { base.as_ptr().cast::<Header>().write(header) }
}
