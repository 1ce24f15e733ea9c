//! Size-class binning.
//!
//! Requests are rounded up to one of a fixed set of slot sizes. Lookups go
//! through a table indexed by `(size + 15) >> 4`, so the hot path is a bounds
//! check and a load.

use crate::{
  error::{Error, Result},
  header::HEADER_SIZE,
  util::{MIN_ALIGN, align_up},
};

const GRANULE_SHIFT: u32 = MIN_ALIGN.trailing_zeros();

/// Maximum number of size classes (class indexes are stored in a `u8`).
pub const MAX_CLASSES: usize = u8::MAX as usize;

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

/// Index of a size class inside a [`SizeClassTable`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SizeClass(u8);

impl SizeClass {
  #[inline]
  pub const fn index(self) -> usize {
    self.0 as usize
  }

  #[inline]
  pub(crate) const fn from_raw(raw: u8) -> Self {
    Self(raw)
  }

  #[inline]
  pub(crate) const fn raw(self) -> u8 {
    self.0
  }
}

/// Convert class index to allocation size for the default progression.
const fn class_to_size(class: usize) -> usize {
  if class < CLASSES_LINEAR {
    (class + 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;
    let base = 128 << order;
    align_up((base * GEO_MULTIPLIERS[sub]) / 16, MIN_ALIGN)
  }
}

/// Default slot sizes up to and including `max` (which must be a multiple of 16).
///
/// 16..128 in 16-byte steps, then four classes per doubling.
pub fn geometric_sizes(max: usize) -> Vec<usize> {
  let mut sizes = Vec::new();
  let mut class = 0;
  loop {
    let size = class_to_size(class);
    if size >= max {
      sizes.push(max);
      return sizes;
    }
    sizes.push(size);
    class += 1;
  }
}

/// Static mapping between request sizes, classes and block geometry.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
  sizes: Box<[usize]>,
  slots: Box<[u32]>,
  first_slot: Box<[u32]>,
  /// `(size + 15) >> 4` -> class index, for every size up to the threshold.
  lookup: Box<[u8]>,
  threshold: usize,
  block_size: usize,
}

impl SizeClassTable {
  /// Builds the table for blocks of `1 << block_size_log` bytes.
  ///
  /// Sizes above the first class that covers `threshold` are dropped.
  pub fn new(sizes: &[usize], threshold: usize, block_size_log: u32) -> Result<Self> {
    let block_size = 1usize
      .checked_shl(block_size_log)
      .ok_or_else(|| Error::config(format!("block_size_log {block_size_log} is too large")))?;
    if threshold == 0 || threshold % MIN_ALIGN != 0 {
      return Err(Error::config(format!(
        "big allocation threshold {threshold} must be a non-zero multiple of {MIN_ALIGN}"
      )));
    }
    if threshold > block_size / 2 {
      return Err(Error::config(format!(
        "big allocation threshold {threshold} exceeds half the block size ({block_size})"
      )));
    }

    let mut kept = Vec::with_capacity(sizes.len());
    let mut prev = 0;
    for &size in sizes {
      if size < MIN_ALIGN || size % MIN_ALIGN != 0 {
        return Err(Error::config(format!(
          "size class {size} is not a multiple of {MIN_ALIGN}"
        )));
      }
      if size <= prev {
        return Err(Error::config("size classes must be strictly ascending"));
      }
      prev = size;
      kept.push(size);
      if size >= threshold {
        break;
      }
    }
    if prev < threshold {
      return Err(Error::config(format!(
        "largest size class {prev} is below the big allocation threshold {threshold}"
      )));
    }
    if kept.len() > MAX_CLASSES {
      return Err(Error::config(format!(
        "{} size classes requested, at most {MAX_CLASSES} supported",
        kept.len()
      )));
    }

    let mut slots = Vec::with_capacity(kept.len());
    let mut first_slot = Vec::with_capacity(kept.len());
    for &size in &kept {
      let reserved = HEADER_SIZE.div_ceil(size) * size;
      let count = (block_size - reserved) / size;
      if count == 0 || count > u32::MAX as usize {
        return Err(Error::config(format!(
          "size class {size} does not fit a {block_size}-byte block"
        )));
      }
      slots.push(count as u32);
      first_slot.push(reserved as u32);
    }

    let entries = (threshold >> GRANULE_SHIFT) + 1;
    let mut lookup = Vec::with_capacity(entries);
    let mut class = 0;
    for granule in 0..entries {
      let size = granule << GRANULE_SHIFT;
      while kept[class] < size {
        class += 1;
      }
      lookup.push(class as u8);
    }

    Ok(Self {
      sizes: kept.into_boxed_slice(),
      slots: slots.into_boxed_slice(),
      first_slot: first_slot.into_boxed_slice(),
      lookup: lookup.into_boxed_slice(),
      threshold,
      block_size,
    })
  }

  /// Class for a request of `size` bytes, or `None` for a big allocation.
  #[inline(always)]
  pub fn class_for(&self, size: usize) -> Option<SizeClass> {
    if size > self.threshold {
      return None;
    }
    Some(SizeClass(self.lookup[(size + MIN_ALIGN - 1) >> GRANULE_SHIFT]))
  }

  #[inline]
  pub fn slot_size(&self, class: SizeClass) -> usize {
    self.sizes[class.index()]
  }

  #[inline]
  pub fn slots_per_block(&self, class: SizeClass) -> usize {
    self.slots[class.index()] as usize
  }

  /// Offset of slot 0 from the block base; the slots before it hold the header.
  #[inline]
  pub fn first_slot_offset(&self, class: SizeClass) -> usize {
    self.first_slot[class.index()] as usize
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.sizes.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.sizes.is_empty()
  }

  /// Largest request served from a block.
  #[inline]
  pub fn threshold(&self) -> usize {
    self.threshold
  }

  #[inline]
  pub fn block_size(&self) -> usize {
    self.block_size
  }

  pub fn classes(&self) -> impl Iterator<Item = SizeClass> + '_ {
    (0..self.sizes.len()).map(|i| SizeClass(i as u8))
  }
}
