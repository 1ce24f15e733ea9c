//! Arenas: per-thread owners of blocks.
//!
//! Every arena keeps, per size class, one current block for the fast path, a
//! list of partially used blocks and a bounded FIFO cache of empty blocks.
//! All state sits behind the arena's spinlock; mapping and unmapping memory
//! always happens after the lock is released.

use core::ptr::NonNull;
use std::collections::VecDeque;

use crate::{
  block::{Block, BlockIds, Checkout},
  error::{AllocKind, Error, Result},
  page::{PageSource, Region},
  size_class::{SizeClass, SizeClassTable},
  sync::SpinLock,
};

pub type BlockId = u32;

/// Where a block currently lives. A block is in exactly one place.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Placement {
  /// `current[class]`.
  Current,
  /// `partial[class]`: has free slots, not current.
  Partial,
  /// Full and not current; only reachable through frees.
  Full,
  /// `cache[class]`: empty, retained for reuse.
  Cached,
}

struct Entry {
  block: Block,
  placement: Placement,
}

struct ArenaState {
  entries: Vec<Option<Entry>>,
  vacant: Vec<BlockId>,
  current: Box<[Option<BlockId>]>,
  partial: Box<[Vec<BlockId>]>,
  cache: Box<[VecDeque<BlockId>]>,
}

/// Per-arena counters, see [`crate::Stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
  pub index: usize,
  /// Blocks owned by the arena, cached ones included.
  pub blocks: usize,
  pub current_blocks: usize,
  pub partial_blocks: usize,
  pub full_blocks: usize,
  pub cached_blocks: usize,
  /// Slot capacity of all blocks, cached ones included.
  pub total_slots: usize,
  /// Largest number of cached blocks held for a single class.
  pub max_cached_per_class: usize,
  pub used_slots: usize,
}

pub struct Arena {
  index: u32,
  owner: u64,
  cache_capacity: usize,
  state: SpinLock<ArenaState>,
}

impl Arena {
  pub fn new(index: u32, owner: u64, classes: usize, cache_capacity: usize, spin_limit: u32) -> Self {
    let state = ArenaState {
      entries: Vec::new(),
      vacant: Vec::new(),
      current: vec![None; classes].into_boxed_slice(),
      partial: (0..classes).map(|_| Vec::new()).collect(),
      cache: (0..classes).map(|_| VecDeque::new()).collect(),
    };
    Self {
      index,
      owner,
      cache_capacity,
      state: SpinLock::new(state, spin_limit),
    }
  }

  /// Hands out one slot of `class`, mapping a new block if nothing is reusable.
  ///
  /// `None` means the page source could not provide memory.
  pub fn alloc_for_class(
    &self,
    class: SizeClass,
    table: &SizeClassTable,
    pages: &PageSource,
  ) -> Option<Checkout> {
    {
      let mut state = self.state.lock();
      if let Some(slot) = state.checkout(class, table) {
        return Some(slot);
      }
    }

    // Slow path: map outside the lock.
    let region = pages.map_aligned(table.block_size(), table.block_size())?;

    let (slot, evicted) = {
      let mut state = self.state.lock();
      let id = state.reserve_id();
      let ids = BlockIds {
        owner: self.owner,
        arena: self.index,
        block: id,
      };
      let mut block = Block::carve(region, class, table, ids);
      let slot = block.checkout_slot();
      state.entries[id as usize] = Some(Entry {
        block,
        placement: Placement::Current,
      });
      let evicted = state.install_current(class, id, self.cache_capacity);
      (slot, evicted)
    };

    if let Some(region) = evicted {
      pages.unmap(region);
    }
    slot
  }

  /// Returns a slot carved by this arena, from any thread.
  ///
  /// An emptied block leaves the partial set for the cache, unless it is the
  /// current block of its class. Evicted cache entries are unmapped after the
  /// lock is dropped. `kind` only labels the error when `id` names no live block.
  pub fn free_slot(
    &self,
    ptr: NonNull<u8>,
    id: BlockId,
    kind: AllocKind,
    pages: &PageSource,
  ) -> Result<()> {
    let evicted = {
      let mut state = self.state.lock();
      state.release(ptr, id, kind, self.cache_capacity)?
    };
    if let Some(region) = evicted {
      pages.unmap(region);
    }
    Ok(())
  }

  /// Unmaps every cached block. Returns how many were released.
  pub fn trim(&self, pages: &PageSource) -> usize {
    let regions: Vec<Region> = {
      let mut state = self.state.lock();
      let ids: Vec<BlockId> = state.cache.iter_mut().flat_map(|queue| queue.drain(..)).collect();
      ids.into_iter().map(|id| state.remove(id)).collect()
    };
    let count = regions.len();
    for region in regions {
      pages.unmap(region);
    }
    count
  }

  /// Unmaps every block the arena owns, live or not.
  ///
  /// Returns the number of slots that were still in use (a caller leak).
  pub fn destroy(&self, pages: &PageSource) -> usize {
    let entries = {
      let mut state = self.state.lock();
      state.vacant.clear();
      state.current.iter_mut().for_each(|c| *c = None);
      state.partial.iter_mut().for_each(Vec::clear);
      state.cache.iter_mut().for_each(VecDeque::clear);
      std::mem::take(&mut state.entries)
    };

    let mut leaked = 0;
    for entry in entries.into_iter().flatten() {
      leaked += entry.block.used_count();
      pages.unmap(entry.block.into_region());
    }
    if leaked != 0 {
      log::warn!(
        "tessera: arena {} destroyed with {leaked} slot(s) still in use",
        self.index
      );
    }
    leaked
  }

  /// Whether one of this arena's blocks, cached ones included, starts at `base`.
  pub fn owns_block(&self, base: usize) -> bool {
    let state = self.state.lock();
    state
      .entries
      .iter()
      .flatten()
      .any(|entry| entry.block.base().as_ptr() as usize == base)
  }

  pub fn stats(&self) -> ArenaStats {
    let state = self.state.lock();
    let mut stats = ArenaStats {
      index: self.index as usize,
      ..ArenaStats::default()
    };
    for entry in state.entries.iter().flatten() {
      stats.blocks += 1;
      stats.used_slots += entry.block.used_count();
      stats.total_slots += entry.block.slot_count();
      match entry.placement {
        Placement::Current => stats.current_blocks += 1,
        Placement::Partial => stats.partial_blocks += 1,
        Placement::Full => stats.full_blocks += 1,
        Placement::Cached => stats.cached_blocks += 1,
      }
    }
    stats.max_cached_per_class = state.cache.iter().map(VecDeque::len).max().unwrap_or(0);
    stats
  }
}

impl ArenaState {
  fn entry(&mut self, id: BlockId) -> &mut Entry {
    match self.entries.get_mut(id as usize) {
      Some(Some(entry)) => entry,
      _ => unreachable!("block id {id} is not live"),
    }
  }

  /// Fast and medium paths: current, partial, cached, then another class's cache.
  fn checkout(&mut self, class: SizeClass, table: &SizeClassTable) -> Option<Checkout> {
    let c = class.index();

    if let Some(id) = self.current[c]
      && let Some(slot) = self.entry(id).block.checkout_slot()
    {
      return Some(slot);
    }

    let id = if let Some(id) = self.partial[c].pop() {
      id
    } else if let Some(id) = self.cache[c].pop_back() {
      id
    } else {
      // Steal the oldest empty block cached for another class.
      let other = self.cache.iter().position(|queue| !queue.is_empty())?;
      let id = self.cache[other].pop_front()?;
      self.entry(id).block.recarve(class, table);
      id
    };

    self.entry(id).placement = Placement::Current;
    let slot = self.entry(id).block.checkout_slot();
    // Current is full (or absent) here, so retiring it cannot evict anything.
    let evicted = self.install_current(class, id, 0);
    debug_assert!(evicted.is_none());
    slot
  }

  /// Makes `id` the current block of `class` and files the previous one.
  fn install_current(&mut self, class: SizeClass, id: BlockId, cache_capacity: usize) -> Option<Region> {
    let c = class.index();
    let previous = self.current[c].replace(id)?;
    if previous == id {
      return None;
    }
    let (full, empty) = {
      let block = &self.entry(previous).block;
      (block.is_full(), block.is_empty())
    };
    if full {
      self.entry(previous).placement = Placement::Full;
      None
    } else if empty {
      self.cache_push(class, previous, cache_capacity)
    } else {
      self.entry(previous).placement = Placement::Partial;
      self.partial[c].push(previous);
      None
    }
  }

  fn release(
    &mut self,
    ptr: NonNull<u8>,
    id: BlockId,
    kind: AllocKind,
    cache_capacity: usize,
  ) -> Result<Option<Region>> {
    let (class, empty, placement) = {
      let Some(Some(entry)) = self.entries.get_mut(id as usize) else {
        return Err(Error::DoubleFree {
          addr: ptr.as_ptr() as usize,
          kind,
        });
      };
      entry.block.return_slot(ptr)?;
      (entry.block.class(), entry.block.is_empty(), entry.placement)
    };

    let c = class.index();
    match placement {
      Placement::Current | Placement::Partial if !empty => Ok(None),
      Placement::Current => Ok(None),
      Placement::Full if !empty => {
        self.entry(id).placement = Placement::Partial;
        self.partial[c].push(id);
        Ok(None)
      }
      Placement::Full => Ok(self.cache_push(class, id, cache_capacity)),
      Placement::Partial => {
        if let Some(pos) = self.partial[c].iter().position(|&p| p == id) {
          self.partial[c].swap_remove(pos);
        }
        Ok(self.cache_push(class, id, cache_capacity))
      }
      // Cached blocks have no slots in use, so `return_slot` already failed.
      Placement::Cached => unreachable!("slot returned to a cached block"),
    }
  }

  /// Files an empty block in the cache, evicting the oldest one when full.
  fn cache_push(&mut self, class: SizeClass, id: BlockId, cache_capacity: usize) -> Option<Region> {
    let c = class.index();
    if cache_capacity == 0 {
      return Some(self.remove(id));
    }
    let evicted = if self.cache[c].len() >= cache_capacity {
      self.cache[c].pop_front().map(|oldest| self.remove(oldest))
    } else {
      None
    };
    self.entry(id).placement = Placement::Cached;
    self.cache[c].push_back(id);
    if evicted.is_some() {
      log::debug!("tessera: block cache for class {c} full, evicting oldest block");
    }
    evicted
  }

  fn reserve_id(&mut self) -> BlockId {
    match self.vacant.pop() {
      Some(id) => id,
      None => {
        self.entries.push(None);
        (self.entries.len() - 1) as BlockId
      }
    }
  }

  fn remove(&mut self, id: BlockId) -> Region {
    let entry = self.entries[id as usize]
      .take()
      .unwrap_or_else(|| unreachable!("block id {id} removed twice"));
    self.vacant.push(id);
    entry.block.into_region()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::header;

  fn table() -> SizeClassTable {
    SizeClassTable::new(&[16, 32, 64, 128, 256, 512, 1024, 4096, 8192], 8192, 15).unwrap()
  }

  fn arena(cache_capacity: usize) -> Arena {
    Arena::new(0, 1, table().len(), cache_capacity, 16)
  }

  fn free(arena: &Arena, slot: Checkout, table: &SizeClassTable, pages: &PageSource) {
    let header = unsafe { header::read(slot.ptr, table.block_size()) };
    arena.free_slot(slot.ptr, header.block, AllocKind::Big, pages).unwrap();
  }

  #[test]
  fn fast_path_reuses_the_last_freed_slot() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(2));
    let class = table.class_for(100).unwrap();

    let a = arena.alloc_for_class(class, &table, &pages).unwrap();
    let b = arena.alloc_for_class(class, &table, &pages).unwrap();
    assert_ne!(a.ptr, b.ptr);
    assert_eq!(pages.system_alloc_count(), 1);

    free(&arena, a, &table, &pages);
    let c = arena.alloc_for_class(class, &table, &pages).unwrap();
    assert_eq!(c.ptr, a.ptr);
    assert!(c.dirty);

    free(&arena, b, &table, &pages);
    free(&arena, c, &table, &pages);
    // The current block stays current even when empty.
    let stats = arena.stats();
    assert_eq!(stats.current_blocks, 1);
    assert_eq!(stats.cached_blocks, 0);
    assert_eq!(stats.used_slots, 0);
    assert_eq!(arena.destroy(&pages), 0);
    assert_eq!(pages.mapped_bytes(), 0);
  }

  #[test]
  fn full_blocks_become_partial_then_cached() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(2));
    let class = table.class_for(8192).unwrap();

    // Three slots per block: fill two blocks.
    let slots: Vec<_> = (0..6)
      .map(|_| arena.alloc_for_class(class, &table, &pages).unwrap())
      .collect();
    let stats = arena.stats();
    assert_eq!((stats.blocks, stats.full_blocks, stats.current_blocks), (2, 1, 1));

    // One free turns the first (full) block into a partial one.
    free(&arena, slots[0], &table, &pages);
    assert_eq!(arena.stats().partial_blocks, 1);

    // Emptying it moves it to the cache.
    free(&arena, slots[1], &table, &pages);
    free(&arena, slots[2], &table, &pages);
    let stats = arena.stats();
    assert_eq!((stats.partial_blocks, stats.cached_blocks), (0, 1));

    for slot in &slots[3..] {
      free(&arena, *slot, &table, &pages);
    }
    assert_eq!(arena.stats().used_slots, 0);
    arena.destroy(&pages);
  }

  #[test]
  fn cached_blocks_are_reused_before_mapping() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(4));
    let class = table.class_for(8192).unwrap();

    let slots: Vec<_> = (0..6)
      .map(|_| arena.alloc_for_class(class, &table, &pages).unwrap())
      .collect();
    for slot in &slots[..3] {
      free(&arena, *slot, &table, &pages);
    }
    assert_eq!(arena.stats().cached_blocks, 1);
    let maps = pages.system_alloc_count();

    // Exhaust the current block, then the cached one must be promoted.
    let more: Vec<_> = (0..3)
      .map(|_| arena.alloc_for_class(class, &table, &pages).unwrap())
      .collect();
    assert_eq!(pages.system_alloc_count(), maps);
    assert_eq!(arena.stats().cached_blocks, 0);

    for slot in slots[3..].iter().chain(&more) {
      free(&arena, *slot, &table, &pages);
    }
    arena.destroy(&pages);
  }

  #[test]
  fn other_class_cache_is_recarved() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(4));
    let big = table.class_for(8192).unwrap();
    let small = table.class_for(16).unwrap();

    let slots: Vec<_> = (0..4)
      .map(|_| arena.alloc_for_class(big, &table, &pages).unwrap())
      .collect();
    for slot in &slots[..3] {
      free(&arena, *slot, &table, &pages);
    }
    assert_eq!(arena.stats().cached_blocks, 1);
    let maps = pages.system_alloc_count();

    let slot = arena.alloc_for_class(small, &table, &pages).unwrap();
    assert_eq!(pages.system_alloc_count(), maps);
    assert_eq!(slot.size, 16);
    assert!(slot.dirty);

    free(&arena, slot, &table, &pages);
    free(&arena, slots[3], &table, &pages);
    arena.destroy(&pages);
  }

  #[test]
  fn cache_is_bounded() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(1));
    let class = table.class_for(8192).unwrap();

    // Four blocks worth of slots; keep the last slot live so the current block stays put.
    let slots: Vec<_> = (0..12)
      .map(|_| arena.alloc_for_class(class, &table, &pages).unwrap())
      .collect();
    for slot in &slots[..9] {
      free(&arena, *slot, &table, &pages);
      assert!(arena.stats().max_cached_per_class <= 1);
    }
    let stats = arena.stats();
    assert_eq!(stats.cached_blocks, 1);
    assert_eq!(stats.blocks, 2);
    assert_eq!(pages.system_free_count(), 2);

    for slot in &slots[9..] {
      free(&arena, *slot, &table, &pages);
    }
    arena.destroy(&pages);
  }

  #[test]
  fn zero_capacity_unmaps_immediately() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(0));
    let class = table.class_for(8192).unwrap();
    let slots: Vec<_> = (0..4)
      .map(|_| arena.alloc_for_class(class, &table, &pages).unwrap())
      .collect();
    for slot in &slots[..3] {
      free(&arena, *slot, &table, &pages);
    }
    assert_eq!(pages.system_free_count(), 1);
    assert_eq!(arena.stats().cached_blocks, 0);
    free(&arena, slots[3], &table, &pages);
    arena.destroy(&pages);
  }

  #[test]
  fn double_free_is_an_error() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(2));
    let class = table.class_for(64).unwrap();
    let slot = arena.alloc_for_class(class, &table, &pages).unwrap();
    let _keep = arena.alloc_for_class(class, &table, &pages).unwrap();
    let header = unsafe { header::read(slot.ptr, table.block_size()) };
    arena.free_slot(slot.ptr, header.block, AllocKind::Big, &pages).unwrap();
    assert!(matches!(
      arena.free_slot(slot.ptr, header.block, AllocKind::Big, &pages),
      Err(Error::DoubleFree { .. })
    ));
    assert_eq!(arena.destroy(&pages), 1);
  }

  #[test]
  fn trim_releases_cached_blocks() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(4));
    let class = table.class_for(8192).unwrap();
    let slots: Vec<_> = (0..4)
      .map(|_| arena.alloc_for_class(class, &table, &pages).unwrap())
      .collect();
    for slot in &slots[..3] {
      free(&arena, *slot, &table, &pages);
    }
    assert_eq!(arena.trim(&pages), 1);
    assert_eq!(arena.stats().blocks, 1);
    free(&arena, slots[3], &table, &pages);
    arena.destroy(&pages);
  }

  #[test]
  fn owns_block_until_the_block_is_unmapped() {
    let (table, pages, arena) = (table(), PageSource::new(None), arena(0));
    let class = table.class_for(16).unwrap();
    let slot = arena.alloc_for_class(class, &table, &pages).unwrap();
    let base = header::base_of(slot.ptr, table.block_size()) as usize;
    // The first 16-byte slot sits right after the header.
    assert_eq!(slot.ptr.as_ptr() as usize - base, header::HEADER_SIZE);
    assert!(arena.owns_block(base));
    assert!(!arena.owns_block(base + table.block_size()));

    free(&arena, slot, &table, &pages);
    assert!(arena.owns_block(base));
    arena.destroy(&pages);
    assert!(!arena.owns_block(base));
  }

  #[test]
  fn failed_mapping_returns_none() {
    let table = table();
    let pages = PageSource::new(Some(table.block_size()));
    let arena = arena(0);
    let class = table.class_for(8192).unwrap();
    let slots: Vec<_> = (0..3)
      .map(|_| arena.alloc_for_class(class, &table, &pages).unwrap())
      .collect();
    assert!(arena.alloc_for_class(class, &table, &pages).is_none());
    for slot in slots {
      free(&arena, slot, &table, &pages);
    }
    arena.destroy(&pages);
  }
}
