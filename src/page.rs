//! System page mappings.

use core::{
  fmt,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::OnceLock;

use crate::util::{align_up, checked_align_up};

/// A page-aligned anonymous mapping.
///
/// Not `Clone`: [`PageSource::unmap`] consumes it, so every mapping is released once.
pub struct Region {
  base: NonNull<u8>,
  len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
  /// Rebuilds a region from parts previously taken apart with [`Region::into_raw_parts`].
  ///
  /// # Safety
  /// `base`/`len` must describe a live mapping that no other `Region` owns.
  pub(crate) unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
    Self { base, len }
  }

  /// Gives up ownership without unmapping.
  pub(crate) fn into_raw_parts(self) -> (NonNull<u8>, usize) {
    (self.base, self.len)
  }

  #[inline]
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  #[inline]
  pub fn as_ptr(&self) -> *mut u8 {
    self.base.as_ptr()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.len
  }
}

impl fmt::Debug for Region {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Region")
      .field("base", &self.base)
      .field("len", &self.len)
      .finish()
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  let ret = unsafe { libc::munmap(ptr.cast(), size) };
  debug_assert!(ret == 0, "munmap({ptr:p}, {size}) failed");
}

/// The system page size, read once from `sysconf`.
pub fn page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 { ps as usize } else { 4096 }
  })
}

// =============================================================================
// Page Source
// =============================================================================

/// Hands out page-aligned regions and keeps mapping statistics.
pub struct PageSource {
  page_size: usize,
  /// Cap on bytes mapped at once (`None` = unlimited).
  limit: Option<usize>,
  mapped_bytes: AtomicUsize,
  /// Successful map calls ("system allocation count").
  maps: AtomicUsize,
  unmaps: AtomicUsize,
}

impl PageSource {
  pub fn new(limit: Option<usize>) -> Self {
    Self {
      page_size: page_size(),
      limit,
      mapped_bytes: AtomicUsize::new(0),
      maps: AtomicUsize::new(0),
      unmaps: AtomicUsize::new(0),
    }
  }

  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Maps at least `len` bytes, rounded up to whole pages.
  pub fn map(&self, len: usize) -> Option<Region> {
    self.map_aligned(len, self.page_size)
  }

  /// Maps at least `len` bytes whose base is aligned to `align`.
  ///
  /// `align` must be a power of two. Alignments above the page size are
  /// obtained by over-mapping and trimming both ends.
  pub fn map_aligned(&self, len: usize, align: usize) -> Option<Region> {
    debug_assert!(align.is_power_of_two());
    let align = align.max(self.page_size);
    let len = checked_align_up(len.max(1), self.page_size)?;
    let slack = align - self.page_size;
    let total = len.checked_add(slack)?;

    if !self.reserve(len) {
      log::debug!("tessera: memory limit reached, refusing to map {len} bytes");
      return None;
    }

    let raw = unsafe { os_mmap(total) };
    if raw.is_null() {
      self.mapped_bytes.fetch_sub(len, Ordering::Relaxed);
      log::debug!("tessera: mmap of {total} bytes failed");
      return None;
    }

    let start = raw as usize;
    let aligned = align_up(start, align);
    let head = aligned - start;
    let tail = total - head - len;
    unsafe {
      if head > 0 {
        os_munmap(raw, head);
      }
      if tail > 0 {
        os_munmap(raw.add(head + len), tail);
      }
    }

    self.maps.fetch_add(1, Ordering::Relaxed);
    log::debug!("tessera: mapped {len} bytes at {aligned:#x}");
    NonNull::new(unsafe { raw.add(head) }).map(|base| Region { base, len })
  }

  /// Returns a region to the system.
  pub fn unmap(&self, region: Region) {
    let (base, len) = region.into_raw_parts();
    unsafe { os_munmap(base.as_ptr(), len) };
    self.mapped_bytes.fetch_sub(len, Ordering::Relaxed);
    self.unmaps.fetch_add(1, Ordering::Relaxed);
    log::debug!("tessera: unmapped {len} bytes at {base:p}");
  }

  /// Number of successful map calls so far.
  pub fn system_alloc_count(&self) -> usize {
    self.maps.load(Ordering::Relaxed)
  }

  pub fn system_free_count(&self) -> usize {
    self.unmaps.load(Ordering::Relaxed)
  }

  /// Bytes currently mapped through this source.
  pub fn mapped_bytes(&self) -> usize {
    self.mapped_bytes.load(Ordering::Relaxed)
  }

  fn reserve(&self, len: usize) -> bool {
    self
      .mapped_bytes
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |mapped| {
        let next = mapped.checked_add(len)?;
        match self.limit {
          Some(limit) if next > limit => None,
          _ => Some(next),
        }
      })
      .is_ok()
  }
}
