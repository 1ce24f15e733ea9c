//! Big allocations: requests above the size-class threshold get a dedicated,
//! block-aligned mapping with the [`Header`] in its first 64 bytes.

use core::ptr::{self, NonNull};
use std::collections::HashMap;

use crate::{
  error::{AllocKind, Error, Result},
  header::{self, HEADER_SIZE, Header, Kind},
  page::{PageSource, Region},
  sync::SpinLock,
};

/// Live big mappings, keyed by base address.
pub struct BigAllocTracker {
  owner: u64,
  block_size: usize,
  live: SpinLock<HashMap<usize, usize>>,
}

impl BigAllocTracker {
  pub fn new(owner: u64, block_size: usize, spin_limit: u32) -> Self {
    Self {
      owner,
      block_size,
      live: SpinLock::new(HashMap::new(), spin_limit),
    }
  }

  /// Maps a region for `size` bytes. `None` if the page source refuses.
  pub fn alloc_big(&self, size: usize, pages: &PageSource) -> Option<NonNull<u8>> {
    let total = size.checked_add(HEADER_SIZE)?;
    let region = pages.map_aligned(total, self.block_size)?;
    let (base, mapped) = region.into_raw_parts();
    unsafe { header::write(base, Header::big(self.owner, mapped, size)) };
    self.live.lock().insert(base.as_ptr() as usize, mapped);
    Some(unsafe { base.add(HEADER_SIZE) })
  }

  /// Resizes a big allocation, in place when the mapping is large enough.
  ///
  /// Copies `min(preserve, old, new_size)` bytes when it has to move. On
  /// failure the original allocation is left untouched.
  ///
  /// # Safety
  /// `ptr` must be a live big allocation from this tracker.
  pub unsafe fn realloc_big(
    &self,
    ptr: NonNull<u8>,
    new_size: usize,
    preserve: usize,
    zero: bool,
    pages: &PageSource,
  ) -> Option<NonNull<u8>> {
    let base = header::base_of(ptr, self.block_size);
    let current = unsafe { base.read() };
    debug_assert_eq!(current.kind, Kind::Big);
    let old_size = current.requested;

    if let Some(needed) = new_size.checked_add(HEADER_SIZE)
      && needed <= current.mapped
    {
      if zero && new_size > old_size {
        unsafe { ptr::write_bytes(ptr.as_ptr().add(old_size), 0, new_size - old_size) };
      }
      unsafe { (*base).requested = new_size };
      return Some(ptr);
    }

    let moved = self.alloc_big(new_size, pages)?;
    let len = preserve.min(old_size).min(new_size);
    unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), len) };
    self.unmap_live(base as usize, pages);
    Some(moved)
  }

  /// Unmaps a big allocation.
  ///
  /// The live table is consulted before the mapping is touched, so freeing an
  /// already unmapped allocation is a [`Error::DoubleFree`].
  ///
  /// # Safety
  /// `ptr` must be a big allocation from this tracker.
  pub unsafe fn free_big(&self, ptr: NonNull<u8>, pages: &PageSource) -> Result<()> {
    let base = header::base_of(ptr, self.block_size) as usize;
    if self.unmap_live(base, pages) {
      Ok(())
    } else {
      Err(Error::DoubleFree {
        addr: ptr.as_ptr() as usize,
        kind: AllocKind::Big,
      })
    }
  }

  /// Whether a live big mapping starts at `base`.
  pub fn is_live(&self, base: usize) -> bool {
    self.live.lock().contains_key(&base)
  }

  fn unmap_live(&self, base: usize, pages: &PageSource) -> bool {
    let Some(mapped) = self.live.lock().remove(&base) else {
      return false;
    };
    if let Some(base) = NonNull::new(base as *mut u8) {
      pages.unmap(unsafe { Region::from_raw_parts(base, mapped) });
    }
    true
  }

  /// Usable bytes behind `ptr`.
  ///
  /// # Safety
  /// `ptr` must be a live big allocation from this tracker.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let header = unsafe { header::read(ptr, self.block_size) };
    header.mapped - HEADER_SIZE
  }

  /// Number of live big allocations.
  pub fn live(&self) -> usize {
    self.live.lock().len()
  }

  /// Total bytes mapped for live big allocations.
  pub fn mapped_bytes(&self) -> usize {
    self.live.lock().values().sum()
  }

  /// Unmaps every live big allocation. Returns how many there were.
  pub fn destroy(&self, pages: &PageSource) -> usize {
    let live = std::mem::take(&mut *self.live.lock());
    let count = live.len();
    for (base, mapped) in live {
      if let Some(base) = NonNull::new(base as *mut u8) {
        pages.unmap(unsafe { Region::from_raw_parts(base, mapped) });
      }
    }
    if count != 0 {
      log::warn!("tessera: {count} big allocation(s) still mapped at teardown");
    }
    count
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const BLOCK: usize = 1 << 15;

  fn fill(ptr: NonNull<u8>, len: usize) {
    for i in 0..len {
      unsafe { ptr.as_ptr().add(i).write(i as u8) };
    }
  }

  fn check(ptr: NonNull<u8>, len: usize) {
    for i in 0..len {
      assert_eq!(unsafe { ptr.as_ptr().add(i).read() }, i as u8, "byte {i}");
    }
  }

  #[test]
  fn header_sits_before_the_pointer() {
    let pages = PageSource::new(None);
    let big = BigAllocTracker::new(9, BLOCK, 16);
    let ptr = big.alloc_big(100_000, &pages).unwrap();

    assert_eq!(ptr.as_ptr() as usize % 64, 0);
    let base = header::base_of(ptr, BLOCK);
    assert_eq!(base as usize, ptr.as_ptr() as usize - HEADER_SIZE);
    let header = unsafe { header::read(ptr, BLOCK) };
    assert_eq!(header.kind, Kind::Big);
    assert_eq!(header.owner, 9);
    assert_eq!(header.requested, 100_000);
    assert_eq!(header.mapped % pages.page_size(), 0);
    assert!(unsafe { big.usable_size(ptr) } >= 100_000);

    fill(ptr, 100_000);
    assert_eq!(big.live(), 1);
    unsafe { big.free_big(ptr, &pages) }.unwrap();
    assert_eq!(big.live(), 0);
    assert_eq!(pages.mapped_bytes(), 0);
  }

  #[test]
  fn realloc_within_mapping_stays_in_place() {
    let pages = PageSource::new(None);
    let big = BigAllocTracker::new(1, BLOCK, 16);
    let ptr = big.alloc_big(10_000, &pages).unwrap();
    fill(ptr, 10_000);
    let maps = pages.system_alloc_count();

    let usable = unsafe { big.usable_size(ptr) };
    let grown = unsafe { big.realloc_big(ptr, usable, usable, true, &pages) }.unwrap();
    assert_eq!(grown, ptr);
    assert_eq!(pages.system_alloc_count(), maps);
    check(ptr, 10_000);
    // Grown bytes are zeroed.
    assert_eq!(unsafe { ptr.as_ptr().add(10_000).read() }, 0);

    let shrunk = unsafe { big.realloc_big(ptr, 9_000, 9_000, true, &pages) }.unwrap();
    assert_eq!(shrunk, ptr);
    assert_eq!(unsafe { header::read(ptr, BLOCK) }.requested, 9_000);
    unsafe { big.free_big(ptr, &pages) }.unwrap();
  }

  #[test]
  fn realloc_beyond_mapping_moves_and_preserves() {
    let pages = PageSource::new(None);
    let big = BigAllocTracker::new(1, BLOCK, 16);
    let ptr = big.alloc_big(20_000, &pages).unwrap();
    fill(ptr, 20_000);

    let moved = unsafe { big.realloc_big(ptr, 1 << 20, 20_000, true, &pages) }.unwrap();
    assert_ne!(moved, ptr);
    check(moved, 20_000);
    assert_eq!(big.live(), 1);
    unsafe { big.free_big(moved, &pages) }.unwrap();
    assert_eq!(pages.mapped_bytes(), 0);
  }

  #[test]
  fn second_free_is_a_double_free() {
    let pages = PageSource::new(None);
    let big = BigAllocTracker::new(1, BLOCK, 16);
    let keep = big.alloc_big(100_000, &pages).unwrap();
    let ptr = big.alloc_big(50_000, &pages).unwrap();
    let base = header::base_of(ptr, BLOCK) as usize;
    assert!(big.is_live(base));

    unsafe { big.free_big(ptr, &pages) }.unwrap();
    assert!(!big.is_live(base));
    let err = unsafe { big.free_big(ptr, &pages) }.unwrap_err();
    assert!(matches!(err, Error::DoubleFree { kind: AllocKind::Big, .. }));
    assert_eq!(big.live(), 1);
    unsafe { big.free_big(keep, &pages) }.unwrap();
  }

  #[test]
  fn failed_realloc_keeps_the_original() {
    let pages = PageSource::new(Some(1 << 17));
    let big = BigAllocTracker::new(1, BLOCK, 16);
    let ptr = big.alloc_big(50_000, &pages).unwrap();
    fill(ptr, 50_000);

    assert!(unsafe { big.realloc_big(ptr, 1 << 20, 50_000, true, &pages) }.is_none());
    check(ptr, 50_000);
    assert_eq!(big.live(), 1);
    assert_eq!(big.destroy(&pages), 1);
    assert_eq!(pages.mapped_bytes(), 0);
  }
}
