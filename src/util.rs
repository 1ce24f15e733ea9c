/// Minimum alignment (and size granule) of every slot.
pub const MIN_ALIGN: usize = 16;

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Like [`align_up`], but `None` on overflow.
#[inline]
pub const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(v) => Some(v & !mask),
    None => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_up_rounds() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(4097, 4096), 8192);
  }

  #[test]
  fn checked_align_up_overflow() {
    assert_eq!(checked_align_up(17, 16), Some(32));
    assert_eq!(checked_align_up(usize::MAX - 3, 16), None);
  }
}
