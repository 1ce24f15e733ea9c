use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Spin rounds before a waiter starts yielding its time slice.
pub const DEFAULT_SPIN_LIMIT: u32 = 64;

/// Upper bound on `spin_loop` hints issued in a single backoff round.
const MAX_SPINS_PER_ROUND: u32 = 1 << 6;

/// Test-and-test-and-set lock guarding `T`.
///
/// Contended waiters back off exponentially for `spin_limit` rounds and then
/// fall back to `std::thread::yield_now`. Acquisition never fails.
pub struct SpinLock<T> {
  locked: AtomicBool,
  spin_limit: u32,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
  pub const fn new(data: T, spin_limit: u32) -> Self {
    Self {
      locked: AtomicBool::new(false),
      spin_limit,
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinGuard<'_, T> {
    if !self.try_acquire() {
      self.lock_contended();
    }
    SpinGuard { lock: self }
  }

  #[inline]
  fn try_acquire(&self) -> bool {
    self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[cold]
  fn lock_contended(&self) {
    let mut spins = 1;
    let mut rounds = 0;
    loop {
      while self.locked.load(Ordering::Relaxed) {
        if rounds < self.spin_limit {
          for _ in 0..spins {
            hint::spin_loop();
          }
          spins = (spins << 1).min(MAX_SPINS_PER_ROUND);
          rounds += 1;
        } else {
          std::thread::yield_now();
        }
      }
      if self.try_acquire() {
        return;
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

pub struct SpinGuard<'a, T> {
  lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.lock.data.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.lock.data.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  fn drop(&mut self) {
    self.lock.unlock();
  }
}
