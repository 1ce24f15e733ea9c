//! The allocator facade: routing, realloc, free and leak accounting.

use core::{
  alloc::Layout,
  cell::RefCell,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::sync::{Arc, Weak};

use crate::{
  arena::Arena,
  big::BigAllocTracker,
  block::Checkout,
  config::{Config, OomPolicy},
  error::{self, AllocKind, Error, Result},
  header::{self, Header, Kind},
  metrics::{Metrics, Stats},
  page::PageSource,
  size_class::{SizeClass, SizeClassTable},
  util::MIN_ALIGN,
};

/// Pass as the size to [`Allocator::free`] or [`Allocator::realloc`] when the
/// caller does not track it; the allocator reads it from the header instead.
pub const SIZE_UNKNOWN: usize = usize::MAX;

/// Allocator ids start at 1 so that a zeroed header never matches.
static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// A thread's arena for one allocator. `alive` dies with the allocator.
struct Binding {
  allocator: u64,
  alive: Weak<()>,
  arena: u32,
}

thread_local! {
  /// Arena bindings for the live allocators this thread has used.
  static ARENA_BINDINGS: RefCell<Vec<Binding>> = const { RefCell::new(Vec::new()) };
}

pub struct Allocator {
  id: u64,
  alive: Arc<()>,
  config: Config,
  classes: SizeClassTable,
  pages: PageSource,
  arenas: Box<[Arena]>,
  big: BigAllocTracker,
  metrics: Metrics,
  next_arena: AtomicUsize,
}

impl Allocator {
  /// Validates `config` and builds an empty allocator. Nothing is mapped yet.
  pub fn new(config: Config) -> Result<Self> {
    config.validate()?;
    let classes = SizeClassTable::new(
      &config.resolved_size_classes(),
      config.resolved_big_threshold(),
      config.block_size_log,
    )?;

    let id = NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed);
    let arena_count = config.resolved_arena_count();
    let arenas = (0..arena_count)
      .map(|index| {
        Arena::new(
          index as u32,
          id,
          classes.len(),
          config.cache_capacity,
          config.spin_limit,
        )
      })
      .collect();

    log::debug!(
      "tessera: allocator {id}: {} size classes, {}-byte blocks, {arena_count} arenas",
      classes.len(),
      classes.block_size()
    );

    Ok(Self {
      id,
      alive: Arc::new(()),
      pages: PageSource::new(config.memory_limit),
      big: BigAllocTracker::new(id, classes.block_size(), config.spin_limit),
      metrics: Metrics::new(classes.len(), config.leak_detection),
      next_arena: AtomicUsize::new(0),
      arenas,
      classes,
      config,
    })
  }

  #[inline]
  pub fn config(&self) -> &Config {
    &self.config
  }

  #[inline]
  pub fn size_classes(&self) -> &SizeClassTable {
    &self.classes
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates at least `size` bytes, 16-byte aligned.
  ///
  /// A zero size still returns a unique pointer (a smallest-class slot).
  /// Memory is zeroed when `zero_on_alloc` is set.
  pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
    match self.classes.class_for(size) {
      Some(class) => self.alloc_small(size, class),
      None => self.alloc_big(size),
    }
  }

  #[inline]
  fn alloc_small(&self, size: usize, class: SizeClass) -> Result<NonNull<u8>> {
    let arena = self.current_arena();
    let Some(Checkout { ptr, size: slot_size, dirty }) =
      arena.alloc_for_class(class, &self.classes, &self.pages)
    else {
      return Err(self.out_of_memory(size));
    };
    if dirty && self.config.zero_on_alloc {
      unsafe { ptr::write_bytes(ptr.as_ptr(), 0, slot_size) };
    }
    self.metrics.on_alloc(self.class_kind(class));
    Ok(ptr)
  }

  fn alloc_big(&self, size: usize) -> Result<NonNull<u8>> {
    // Fresh mappings are zero-filled already.
    let ptr = self
      .big
      .alloc_big(size, &self.pages)
      .ok_or_else(|| self.out_of_memory(size))?;
    self.metrics.on_alloc(AllocKind::Big);
    Ok(ptr)
  }

  // ===========================================================================
  // Reallocation
  // ===========================================================================

  /// Resizes an allocation.
  ///
  /// * a null `ptr` behaves like [`Allocator::alloc`];
  /// * a zero `new_size` frees `ptr` and returns null;
  /// * staying in the same size class returns `ptr` itself;
  /// * otherwise the first `min(preserve, old_size, new_size)` bytes are kept.
  ///
  /// On error `ptr` is still valid and unchanged.
  ///
  /// # Safety
  /// `ptr` must be null or a live allocation from this allocator, and
  /// `old_size` its requested size or [`SIZE_UNKNOWN`].
  pub unsafe fn realloc(
    &self,
    ptr: *mut u8,
    old_size: usize,
    new_size: usize,
    preserve: usize,
  ) -> Result<*mut u8> {
    let Some(old) = NonNull::new(ptr) else {
      return self.alloc(new_size).map(NonNull::as_ptr);
    };
    if new_size == 0 {
      unsafe { self.free(ptr, old_size) };
      return Ok(null_mut());
    }

    let header = unsafe { self.header_of(old) };
    let usable = self.usable_from_header(&header);
    let old_size = if old_size == SIZE_UNKNOWN { usable } else { old_size.min(usable) };

    match (header.kind, self.classes.class_for(new_size)) {
      (Kind::Small, Some(class)) if class.raw() == header.class => {
        if self.config.zero_on_alloc && new_size > old_size {
          unsafe { ptr::write_bytes(ptr.add(old_size), 0, new_size - old_size) };
        }
        Ok(ptr)
      }
      (Kind::Big, None) => {
        let zero = self.config.zero_on_alloc;
        let moved = unsafe { self.big.realloc_big(old, new_size, preserve, zero, &self.pages) }
          .ok_or_else(|| self.out_of_memory(new_size))?;
        if moved != old {
          self.metrics.on_move();
        }
        Ok(moved.as_ptr())
      }
      _ => {
        let moved = self.alloc(new_size)?;
        let len = preserve.min(old_size).min(new_size);
        unsafe {
          ptr::copy_nonoverlapping(ptr, moved.as_ptr(), len);
          self.free(ptr, old_size);
        }
        Ok(moved.as_ptr())
      }
    }
  }

  // ===========================================================================
  // Free
  // ===========================================================================

  /// Releases an allocation. A null `ptr` is ignored.
  ///
  /// Panics on a detected double free.
  ///
  /// # Safety
  /// `ptr` must be null or an allocation from this allocator, and `size` its
  /// requested size or [`SIZE_UNKNOWN`].
  pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    let addr = ptr.as_ptr() as usize;

    // Checked before touching the pointer's memory.
    if let Err(err) = self.metrics.release_total(addr).and_then(|()| self.ensure_mapped(ptr)) {
      error::fatal(&err);
    }

    let header = unsafe { self.header_of(ptr) };
    debug_assert!(
      size == SIZE_UNKNOWN || size <= self.usable_from_header(&header),
      "free({ptr:p}, {size}) with a size larger than the allocation"
    );

    let result = match header.kind {
      Kind::Small => {
        let kind = self.class_kind(SizeClass::from_raw(header.class));
        self.metrics.release(kind, addr).and_then(|()| {
          self.arenas[header.arena as usize].free_slot(ptr, header.block, kind, &self.pages)
        })
      }
      Kind::Big => self
        .metrics
        .release(AllocKind::Big, addr)
        .and_then(|()| unsafe { self.big.free_big(ptr, &self.pages) }),
    };
    if let Err(err) = result {
      error::fatal(&err);
    }
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Bytes usable behind `ptr` (the slot size, or the mapping minus the header).
  ///
  /// # Safety
  /// `ptr` must be a live allocation from this allocator.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let header = unsafe { self.header_of(ptr) };
    match header.kind {
      Kind::Small => self.usable_from_header(&header),
      Kind::Big => unsafe { self.big.usable_size(ptr) },
    }
  }

  /// Live allocations (always 0 when leak detection is disabled).
  pub fn outstanding(&self) -> usize {
    self.metrics.outstanding()
  }

  pub fn stats(&self) -> Stats {
    Stats {
      allocations: self.metrics.allocations(),
      frees: self.metrics.frees(),
      outstanding: self.metrics.outstanding(),
      outstanding_by_class: self
        .classes
        .classes()
        .map(|class| self.metrics.outstanding_for(self.class_kind(class)))
        .collect(),
      big_outstanding: self.big.live(),
      big_mapped_bytes: self.big.mapped_bytes(),
      system_allocs: self.pages.system_alloc_count(),
      system_frees: self.pages.system_free_count(),
      mapped_bytes: self.pages.mapped_bytes(),
      arenas: self.arenas.iter().map(Arena::stats).collect(),
    }
  }

  /// Logs every outstanding allocation count. Returns the total.
  pub fn report_leaks(&self) -> usize {
    if !self.metrics.enabled() {
      return 0;
    }
    let total = self.metrics.outstanding();
    if total == 0 {
      return 0;
    }
    log::warn!("tessera: allocator {} has {total} outstanding allocation(s)", self.id);
    for class in self.classes.classes() {
      let kind = self.class_kind(class);
      let count = self.metrics.outstanding_for(kind);
      if count != 0 {
        log::warn!("tessera:   {count} in {kind}");
      }
    }
    let big = self.metrics.outstanding_for(AllocKind::Big);
    if big != 0 {
      log::warn!("tessera:   {big} big allocation(s)");
    }
    total
  }

  /// Unmaps every cached empty block. Returns how many were released.
  pub fn trim(&self) -> usize {
    self.arenas.iter().map(|arena| arena.trim(&self.pages)).sum()
  }

  // ===========================================================================
  // Internals
  // ===========================================================================

  /// The arena bound to the calling thread, binding one round-robin on first use.
  fn current_arena(&self) -> &Arena {
    let index = ARENA_BINDINGS
      .try_with(|bindings| {
        let mut bindings = bindings.borrow_mut();
        if let Some(binding) = bindings.iter().find(|b| b.allocator == self.id) {
          return binding.arena as usize;
        }
        // Allocators dropped on other threads leave bindings behind here.
        bindings.retain(|b| b.alive.strong_count() != 0);
        let index = self.next_arena_index();
        bindings.push(Binding {
          allocator: self.id,
          alive: Arc::downgrade(&self.alive),
          arena: index as u32,
        });
        index
      })
      // Thread-locals are gone during thread teardown.
      .unwrap_or_else(|_| self.next_arena_index());
    &self.arenas[index]
  }

  #[inline]
  fn next_arena_index(&self) -> usize {
    self.next_arena.fetch_add(1, Ordering::Relaxed) % self.arenas.len()
  }

  #[inline]
  fn class_kind(&self, class: SizeClass) -> AllocKind {
    AllocKind::Class {
      class: class.raw(),
      slot_size: self.classes.slot_size(class),
    }
  }

  /// A pointer `HEADER_SIZE` past a block-aligned base may be a big
  /// allocation. If that base is neither a live big mapping nor a block of any
  /// arena, an earlier free unmapped it and its header must not be read.
  fn ensure_mapped(&self, ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    let base = header::base_of(ptr, self.classes.block_size()) as usize;
    if addr - base != header::HEADER_SIZE
      || self.big.is_live(base)
      || self.arenas.iter().any(|arena| arena.owns_block(base))
    {
      return Ok(());
    }
    Err(Error::DoubleFree {
      addr,
      kind: AllocKind::Big,
    })
  }

  /// # Safety
  /// `ptr` must be a live allocation from this allocator.
  #[inline]
  unsafe fn header_of(&self, ptr: NonNull<u8>) -> Header {
    let header = unsafe { header::read(ptr, self.classes.block_size()) };
    debug_assert!(
      header.is_valid() && header.owner == self.id,
      "{ptr:p} was not allocated by tessera allocator {}",
      self.id
    );
    header
  }

  fn usable_from_header(&self, header: &Header) -> usize {
    match header.kind {
      Kind::Small => self.classes.slot_size(SizeClass::from_raw(header.class)),
      Kind::Big => header.mapped - header::HEADER_SIZE,
    }
  }

  /// Applies the OOM policy: aborts, or hands the error back.
  #[cold]
  fn out_of_memory(&self, size: usize) -> Error {
    match self.config.oom_policy {
      OomPolicy::ReturnError => {
        log::debug!("tessera: out of memory allocating {size} bytes");
        Error::OutOfMemory { size }
      }
      OomPolicy::Abort => {
        log::error!("tessera: out of memory allocating {size} bytes");
        let layout = Layout::from_size_align(size, MIN_ALIGN).unwrap_or(Layout::new::<u8>());
        std::alloc::handle_alloc_error(layout)
      }
    }
  }
}

impl Drop for Allocator {
  fn drop(&mut self) {
    let _ = ARENA_BINDINGS.try_with(|bindings| {
      if let Ok(mut bindings) = bindings.try_borrow_mut() {
        bindings.retain(|b| b.allocator != self.id);
      }
    });
    self.report_leaks();
    let leaked: usize = self.arenas.iter().map(|arena| arena.destroy(&self.pages)).sum();
    let big = self.big.destroy(&self.pages);
    log::debug!(
      "tessera: allocator {} dropped ({leaked} slot(s) and {big} big allocation(s) reclaimed)",
      self.id
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scenario() -> Allocator {
    Allocator::new(Config {
      size_classes: Some(vec![16, 32, 64, 128, 256, 512, 1024, 4096, 8192]),
      big_threshold: Some(8192),
      arena_count: 2,
      ..Config::default()
    })
    .unwrap()
  }

  #[test]
  fn threads_stay_bound_to_one_arena() {
    let allocator = scenario();
    let arena_addr = || allocator.current_arena() as *const Arena as usize;
    let first = arena_addr();
    for _ in 0..10 {
      assert_eq!(arena_addr(), first);
    }
    let other = std::thread::scope(|s| s.spawn(arena_addr).join().unwrap());
    assert_ne!(other, first);
  }

  fn bindings() -> Vec<u64> {
    ARENA_BINDINGS.with(|b| b.borrow().iter().map(|b| b.allocator).collect())
  }

  #[test]
  fn bindings_do_not_outlive_their_allocator() {
    std::thread::spawn(|| {
      for _ in 0..100 {
        let allocator = scenario();
        let ptr = allocator.alloc(32).unwrap();
        unsafe { allocator.free(ptr.as_ptr(), 32) };
      }
      assert!(bindings().is_empty());

      // Dropped elsewhere: pruned when this thread binds its next allocator.
      let kept = scenario();
      let moved = scenario();
      kept.current_arena();
      moved.current_arena();
      let moved_id = moved.id;
      std::thread::spawn(move || drop(moved)).join().unwrap();
      assert!(bindings().contains(&moved_id));

      let fresh = scenario();
      fresh.current_arena();
      assert_eq!(bindings(), vec![kept.id, fresh.id]);
    })
    .join()
    .unwrap();
  }

  #[test]
  fn big_realloc_that_moves_counts_as_an_allocation() {
    let allocator = scenario();
    let ptr = allocator.alloc(20_000).unwrap().as_ptr();
    unsafe {
      let moved = allocator.realloc(ptr, 20_000, 1 << 20, 20_000).unwrap();
      assert_ne!(moved, ptr);
      let stats = allocator.stats();
      assert_eq!((stats.allocations, stats.frees), (2, 1));
      assert_eq!(stats.outstanding, 1);
      allocator.free(moved, 1 << 20);
    }
  }

  #[test]
  fn realloc_within_class_zeroes_the_grown_tail() {
    let allocator = scenario();
    let ptr = allocator.alloc(40).unwrap().as_ptr();
    unsafe {
      ptr::write_bytes(ptr, 0xEE, 64);
      let same = allocator.realloc(ptr, 40, 60, 40).unwrap();
      assert_eq!(same, ptr);
      assert_eq!(*ptr.add(39), 0xEE);
      assert_eq!(*ptr.add(40), 0);
      assert_eq!(*ptr.add(59), 0);
      allocator.free(ptr, 60);
    }
  }

  #[test]
  fn header_owner_is_the_allocator() {
    let a = scenario();
    let b = scenario();
    assert_ne!(a.id, b.id);
    let ptr = a.alloc(100).unwrap();
    assert_eq!(unsafe { a.header_of(ptr) }.owner, a.id);
    unsafe { a.free(ptr.as_ptr(), 100) };
  }

  #[test]
  fn drop_reclaims_leaked_memory() {
    let allocator = scenario();
    let _small = allocator.alloc(10).unwrap();
    let _big = allocator.alloc(100_000).unwrap();
    assert_eq!(allocator.report_leaks(), 2);
    // Drop unmaps both; the process keeps running with nothing left mapped.
  }
}
