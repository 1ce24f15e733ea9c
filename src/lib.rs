//! tessera: a thread-caching slab allocator.
//!
//! Small requests are rounded up to a size class and served from
//! block-aligned blocks owned by per-thread arenas; each arena keeps a
//! bounded cache of empty blocks per class. Requests above the big
//! threshold get their own mapping. Every block and big mapping starts with
//! a 64-byte header, found from any pointer by masking.
//!
//! ```no_run
//! use tessera::{Allocator, Config};
//!
//! let allocator = Allocator::new(Config::default())?;
//! let ptr = allocator.alloc(100)?;
//! unsafe { allocator.free(ptr.as_ptr(), 100) };
//! # Ok::<(), tessera::Error>(())
//! ```
//!
//! A process-wide instance is available through [`global`], [`alloc`],
//! [`realloc`] and [`free`].

mod allocator;
mod arena;
mod big;
mod block;
pub mod config;
pub mod error;
mod header;
pub mod metrics;
pub mod page;
pub mod size_class;
mod sync;
mod util;

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicBool, Ordering},
};
use std::sync::{Once, OnceLock};

pub use allocator::{Allocator, SIZE_UNKNOWN};
pub use arena::ArenaStats;
pub use config::{Config, OomPolicy};
pub use error::{AllocKind, Error, Result};
pub use metrics::Stats;
pub use size_class::{SizeClass, SizeClassTable, geometric_sizes};

// =============================================================================
// Process-wide allocator
// =============================================================================

static GLOBAL: OnceLock<Allocator> = OnceLock::new();
static LEAKS_REPORTED: AtomicBool = AtomicBool::new(false);
static EXIT_HOOK: Once = Once::new();

/// Installs the process-wide allocator with an explicit configuration.
///
/// Fails with [`Error::AlreadyInitialized`] once [`global`] has been used.
pub fn init(config: Config) -> Result<&'static Allocator> {
  let allocator = Allocator::new(config)?;
  let mut installed = false;
  let global = GLOBAL.get_or_init(|| {
    installed = true;
    allocator
  });
  if !installed {
    return Err(Error::AlreadyInitialized);
  }
  register_exit_hook(global);
  Ok(global)
}

/// The process-wide allocator, built from [`Config::from_env`] on first use.
pub fn global() -> &'static Allocator {
  GLOBAL.get_or_init(|| {
    let allocator = Config::from_env()
      .and_then(Allocator::new)
      .or_else(|err| {
        log::warn!("tessera: {err}; using the default configuration");
        Allocator::new(fallback_config())
      })
      .unwrap_or_else(|err| {
        log::error!("tessera: cannot build the global allocator: {err}");
        panic!("tessera: cannot build the global allocator: {err}")
      });
    register_exit_hook(&allocator);
    allocator
  })
}

/// Defaults, with blocks no smaller than a page.
fn fallback_config() -> Config {
  let page_log = page::page_size().trailing_zeros();
  let defaults = Config::default();
  Config {
    block_size_log: defaults.block_size_log.max(page_log),
    ..defaults
  }
}

fn register_exit_hook(allocator: &Allocator) {
  if !allocator.config().leak_detection {
    return;
  }
  EXIT_HOOK.call_once(|| {
    if unsafe { libc::atexit(report_at_exit) } != 0 {
      log::warn!("tessera: could not register the exit-time leak report");
    }
  });
}

extern "C" fn report_at_exit() {
  shutdown();
}

/// Allocates from the process-wide allocator.
pub fn alloc(size: usize) -> Result<NonNull<u8>> {
  global().alloc(size)
}

/// Reallocates through the process-wide allocator.
///
/// # Safety
/// See [`Allocator::realloc`].
pub unsafe fn realloc(ptr: *mut u8, old_size: usize, new_size: usize, preserve: usize) -> Result<*mut u8> {
  unsafe { global().realloc(ptr, old_size, new_size, preserve) }
}

/// Frees through the process-wide allocator.
///
/// # Safety
/// See [`Allocator::free`].
pub unsafe fn free(ptr: *mut u8, size: usize) {
  unsafe { global().free(ptr, size) }
}

/// Reports leaks of the process-wide allocator (once) and releases its cached blocks.
///
/// Returns the number of outstanding allocations. Allocations stay valid.
pub fn shutdown() -> usize {
  let Some(allocator) = GLOBAL.get() else {
    return 0;
  };
  let outstanding = allocator.outstanding();
  if !LEAKS_REPORTED.swap(true, Ordering::AcqRel) {
    allocator.report_leaks();
  }
  allocator.trim();
  outstanding
}
