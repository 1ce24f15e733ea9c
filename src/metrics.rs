//! Leak counters and introspection.
//!
//! One global outstanding counter plus one per size class and one for big
//! allocations. A decrement below zero is a double free and is reported
//! before any memory is touched.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{
  arena::ArenaStats,
  error::{AllocKind, Error, Result},
};

/// An outstanding-allocation counter that refuses to underflow.
#[derive(Default)]
pub struct Counter(AtomicUsize);

impl Counter {
  #[inline]
  pub fn increment(&self) {
    self.0.fetch_add(1, Ordering::Relaxed);
  }

  /// Decrements, or returns `false` if the counter is already zero.
  #[inline]
  pub fn decrement(&self) -> bool {
    self
      .0
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
      .is_ok()
  }

  #[inline]
  pub fn get(&self) -> usize {
    self.0.load(Ordering::Relaxed)
  }
}

pub struct Metrics {
  enabled: bool,
  outstanding: Counter,
  classes: Box<[Counter]>,
  big: Counter,
  allocations: AtomicU64,
  frees: AtomicU64,
}

impl Metrics {
  pub fn new(classes: usize, enabled: bool) -> Self {
    Self {
      enabled,
      outstanding: Counter::default(),
      classes: (0..classes).map(|_| Counter::default()).collect(),
      big: Counter::default(),
      allocations: AtomicU64::new(0),
      frees: AtomicU64::new(0),
    }
  }

  #[inline]
  pub fn enabled(&self) -> bool {
    self.enabled
  }

  fn counter(&self, kind: AllocKind) -> Option<&Counter> {
    match kind {
      AllocKind::Class { class, .. } => self.classes.get(class as usize),
      AllocKind::Big => Some(&self.big),
      AllocKind::Unknown => None,
    }
  }

  #[inline]
  pub fn on_alloc(&self, kind: AllocKind) {
    self.allocations.fetch_add(1, Ordering::Relaxed);
    if self.enabled {
      self.outstanding.increment();
      if let Some(counter) = self.counter(kind) {
        counter.increment();
      }
    }
  }

  /// A reallocation moved to a new mapping without going through alloc and
  /// free: one allocation and one free, outstanding unchanged.
  #[inline]
  pub fn on_move(&self) {
    self.allocations.fetch_add(1, Ordering::Relaxed);
    self.frees.fetch_add(1, Ordering::Relaxed);
  }

  /// First check on free: the global counter. Runs before the pointer is read,
  /// so the kind is not known yet.
  #[inline]
  pub fn release_total(&self, addr: usize) -> Result<()> {
    if self.enabled && !self.outstanding.decrement() {
      return Err(Self::underflow(addr));
    }
    Ok(())
  }

  /// Second check on free: the counter of the allocation's kind.
  #[inline]
  pub fn release(&self, kind: AllocKind, addr: usize) -> Result<()> {
    self.frees.fetch_add(1, Ordering::Relaxed);
    if self.enabled
      && let Some(counter) = self.counter(kind)
      && !counter.decrement()
    {
      return Err(Error::DoubleFree { addr, kind });
    }
    Ok(())
  }

  /// Outstanding allocations across all kinds.
  #[inline]
  pub fn outstanding(&self) -> usize {
    self.outstanding.get()
  }

  #[cold]
  fn underflow(addr: usize) -> Error {
    Error::DoubleFree {
      addr,
      kind: AllocKind::Unknown,
    }
  }

  pub fn outstanding_for(&self, kind: AllocKind) -> usize {
    self.counter(kind).map_or(0, Counter::get)
  }

  pub fn allocations(&self) -> u64 {
    self.allocations.load(Ordering::Relaxed)
  }

  pub fn frees(&self) -> u64 {
    self.frees.load(Ordering::Relaxed)
  }
}

/// Snapshot returned by [`crate::Allocator::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
  /// Successful allocations, reallocations that moved included (a moving
  /// reallocation also counts one free).
  pub allocations: u64,
  pub frees: u64,
  /// Live allocations (0 when leak detection is disabled).
  pub outstanding: usize,
  /// Live allocations per size class, indexed by class.
  pub outstanding_by_class: Vec<usize>,
  pub big_outstanding: usize,
  pub big_mapped_bytes: usize,
  /// Successful system map calls.
  pub system_allocs: usize,
  pub system_frees: usize,
  pub mapped_bytes: usize,
  pub arenas: Vec<ArenaStats>,
}

impl Stats {
  /// Empty blocks held across all arenas.
  pub fn cached_blocks(&self) -> usize {
    self.arenas.iter().map(|a| a.cached_blocks).sum()
  }
}
