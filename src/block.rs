//! Blocks: block-aligned regions carved into equal slots of one size class.
//!
//! Slot bookkeeping lives in a side table owned by the arena (a bump index
//! for never-used slots, a stack of returned slot indexes and an in-use
//! bitmap), never inside the slots themselves. The block memory only carries
//! the [`Header`] in its reserved leading slots.

use core::ptr::NonNull;

use crate::{
  error::{AllocKind, Error, Result},
  header::{self, Header},
  page::Region,
  size_class::{SizeClass, SizeClassTable},
};

/// Ids written into the header so that a freed pointer finds its block.
#[derive(Clone, Copy, Debug)]
pub struct BlockIds {
  pub owner: u64,
  pub arena: u32,
  pub block: u32,
}

/// A slot handed out by [`Block::checkout_slot`].
#[derive(Clone, Copy, Debug)]
pub struct Checkout {
  pub ptr: NonNull<u8>,
  /// Slot size of the class it came from.
  pub size: usize,
  /// The slot may hold bytes from an earlier allocation.
  pub dirty: bool,
}

pub struct Block {
  region: Region,
  ids: BlockIds,
  class: SizeClass,
  slot_size: usize,
  first_slot: usize,
  slot_count: u32,
  /// Slots at or above this index have never been handed out since carving.
  bump: u32,
  /// Returned slots, most recent last.
  free: Vec<u32>,
  in_use: Vec<u64>,
  used: u32,
  /// Slots never handed out are still zero-filled from the mapping.
  fresh: bool,
}

impl Block {
  /// Carves a freshly mapped region into slots of `class`.
  ///
  /// Panics if the region is smaller than a block: that is a bug in the caller.
  pub fn carve(region: Region, class: SizeClass, table: &SizeClassTable, ids: BlockIds) -> Self {
    assert!(
      region.len() >= table.block_size(),
      "region of {} bytes cannot hold a {}-byte block",
      region.len(),
      table.block_size()
    );
    debug_assert_eq!(region.as_ptr() as usize % table.block_size(), 0);

    let mut block = Self {
      region,
      ids,
      class,
      slot_size: 0,
      first_slot: 0,
      slot_count: 0,
      bump: 0,
      free: Vec::new(),
      in_use: Vec::new(),
      used: 0,
      fresh: true,
    };
    block.reset(class, table);
    block
  }

  /// Re-targets an empty block at another size class.
  pub fn recarve(&mut self, class: SizeClass, table: &SizeClassTable) {
    assert!(self.is_empty(), "recarving a block with live slots");
    self.fresh = false;
    self.reset(class, table);
  }

  fn reset(&mut self, class: SizeClass, table: &SizeClassTable) {
    let slot_count = table.slots_per_block(class);
    self.class = class;
    self.slot_size = table.slot_size(class);
    self.first_slot = table.first_slot_offset(class);
    self.slot_count = slot_count as u32;
    self.bump = 0;
    self.used = 0;
    self.free.clear();
    self.in_use.clear();
    self.in_use.resize(slot_count.div_ceil(64), 0);

    let header = Header::small(self.ids.owner, self.ids.arena, self.ids.block, class.raw());
    unsafe { header::write(self.base(), header) };
    log::trace!(
      "tessera: carved block {:p} into {} slots of {} bytes",
      self.base(),
      slot_count,
      self.slot_size
    );
  }

  /// Takes one slot, or `None` if the block is full.
  #[inline]
  pub fn checkout_slot(&mut self) -> Option<Checkout> {
    let (index, dirty) = match self.free.pop() {
      Some(index) => (index, true),
      None if self.bump < self.slot_count => {
        self.bump += 1;
        (self.bump - 1, !self.fresh)
      }
      None => return None,
    };

    let (word, bit) = bit_of(index);
    debug_assert!(self.in_use[word] & bit == 0, "slot {index} handed out twice");
    self.in_use[word] |= bit;
    self.used += 1;
    debug_assert_eq!(self.used as usize, self.bump as usize - self.free.len());

    let ptr = unsafe { self.slot_ptr(index) };
    Some(Checkout {
      ptr,
      size: self.slot_size,
      dirty,
    })
  }

  /// Puts back a slot obtained from this block.
  ///
  /// Returns [`Error::DoubleFree`] if the slot is not currently handed out.
  pub fn return_slot(&mut self, ptr: NonNull<u8>) -> Result<()> {
    let index = self.index_of(ptr).ok_or_else(|| self.double_free(ptr))?;
    let (word, bit) = bit_of(index);
    if self.in_use[word] & bit == 0 {
      return Err(self.double_free(ptr));
    }
    self.in_use[word] &= !bit;
    self.free.push(index);
    self.used -= 1;
    debug_assert_eq!(self.used as usize, self.bump as usize - self.free.len());
    Ok(())
  }

  /// Slot index of `ptr`, if it points at the start of a slot handed out at least once.
  fn index_of(&self, ptr: NonNull<u8>) -> Option<u32> {
    if !self.region.contains(ptr.as_ptr()) {
      return None;
    }
    let offset = (ptr.as_ptr() as usize)
      .checked_sub(self.region.as_ptr() as usize)?
      .checked_sub(self.first_slot)?;
    if offset % self.slot_size != 0 {
      return None;
    }
    let index = offset / self.slot_size;
    (index < self.bump as usize).then_some(index as u32)
  }

  /// # Safety
  /// `index` must be below `slot_count`.
  #[inline]
  unsafe fn slot_ptr(&self, index: u32) -> NonNull<u8> {
    let offset = self.first_slot + index as usize * self.slot_size;
    unsafe { self.region.base().add(offset) }
  }

  fn double_free(&self, ptr: NonNull<u8>) -> Error {
    Error::DoubleFree {
      addr: ptr.as_ptr() as usize,
      kind: AllocKind::Class {
        class: self.class.raw(),
        slot_size: self.slot_size,
      },
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.used == 0
  }

  #[inline]
  pub fn is_full(&self) -> bool {
    self.used == self.slot_count
  }

  #[inline]
  pub fn used_count(&self) -> usize {
    self.used as usize
  }

  #[inline]
  pub fn slot_count(&self) -> usize {
    self.slot_count as usize
  }

  #[inline]
  pub fn class(&self) -> SizeClass {
    self.class
  }

  #[inline]
  pub fn base(&self) -> NonNull<u8> {
    self.region.base()
  }

  /// Releases the bookkeeping and hands back the memory for unmapping.
  pub fn into_region(self) -> Region {
    self.region
  }
}

#[inline(always)]
fn bit_of(index: u32) -> (usize, u64) {
  ((index / 64) as usize, 1u64 << (index % 64))
}
