//! Allocator errors.

use core::fmt;

use thiserror::Error;

/// Result type for allocator operations.
pub type Result<T> = core::result::Result<T, Error>;

/// What kind of allocation an error or counter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
  /// A slot of the given size class.
  Class { class: u8, slot_size: usize },
  /// A direct system mapping.
  Big,
  /// Not determined: nothing at all was outstanding.
  Unknown,
}

impl fmt::Display for AllocKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AllocKind::Class { class, slot_size } => {
        write!(f, "size class {class} ({slot_size}-byte slots)")
      }
      AllocKind::Big => f.write_str("big allocation"),
      AllocKind::Unknown => f.write_str("no allocation outstanding"),
    }
  }
}

/// Errors reported by the allocator.
#[derive(Debug, Error)]
pub enum Error {
  /// The page source could not map memory (or the memory limit was reached).
  #[error("out of memory while allocating {size} bytes")]
  OutOfMemory { size: usize },

  /// A configuration value was rejected.
  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  /// A pointer was freed while not allocated.
  #[error("double free of {addr:#x} ({kind})")]
  DoubleFree { addr: usize, kind: AllocKind },

  /// `tessera::init` was called after the global allocator was created.
  #[error("global allocator is already initialized")]
  AlreadyInitialized,
}

impl Error {
  pub(crate) fn config(message: impl Into<String>) -> Self {
    Error::InvalidConfig(message.into())
  }
}

/// Reports a corrupted-state condition and stops the calling thread.
///
/// Continuing after a double free would operate on a broken free list.
#[cold]
#[inline(never)]
pub(crate) fn fatal(err: &Error) -> ! {
  log::error!("tessera: {err}");
  panic!("tessera: {err}");
}
