//! Allocator configuration.
//!
//! A [`Config`] is validated once by [`crate::Allocator::new`] and is
//! immutable afterwards. [`Config::from_env`] reads overrides from the
//! environment:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `TESSERA_BLOCK_SIZE_LOG` | `block_size_log` | 15 (32 KiB) |
//! | `TESSERA_BIG_THRESHOLD` | `big_threshold` | block size / 4 |
//! | `TESSERA_ARENAS` | `arena_count` | available parallelism |
//! | `TESSERA_CACHE_BLOCKS` | `cache_capacity` | 4 |
//! | `TESSERA_ZERO_ON_ALLOC` | `zero_on_alloc` | true |
//! | `TESSERA_LEAK_DETECTION` | `leak_detection` | true |
//! | `TESSERA_MEMORY_LIMIT` | `memory_limit` (0 = unlimited) | unlimited |
//! | `TESSERA_OOM` | `oom_policy` (`abort`/`error`) | abort |
//! | `TESSERA_SPIN_LIMIT` | `spin_limit` | 64 |

use std::{env, thread};

use crate::{
  error::{Error, Result},
  page::page_size,
  size_class::geometric_sizes,
  sync::DEFAULT_SPIN_LIMIT,
};

pub const MIN_BLOCK_SIZE_LOG: u32 = 12;
pub const MAX_BLOCK_SIZE_LOG: u32 = 24;
pub const MAX_ARENAS: usize = 64;

/// What happens when the system refuses memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OomPolicy {
  /// Log and call [`std::alloc::handle_alloc_error`].
  #[default]
  Abort,
  /// Return [`Error::OutOfMemory`] to the caller.
  ReturnError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Blocks are `1 << block_size_log` bytes and aligned to their size.
  pub block_size_log: u32,
  /// Ascending slot sizes; `None` uses [`geometric_sizes`].
  pub size_classes: Option<Vec<usize>>,
  /// Largest request served from a block; `None` means a quarter block.
  pub big_threshold: Option<usize>,
  /// Empty blocks kept per size class and arena.
  pub cache_capacity: usize,
  /// Arenas in the pool; 0 means one per available CPU.
  pub arena_count: usize,
  pub zero_on_alloc: bool,
  /// Keep the outstanding counters (and detect double frees through them).
  pub leak_detection: bool,
  pub oom_policy: OomPolicy,
  /// Cap on bytes mapped at once.
  pub memory_limit: Option<usize>,
  /// Spin rounds before a contended lock starts yielding.
  pub spin_limit: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      block_size_log: 15,
      size_classes: None,
      big_threshold: None,
      cache_capacity: 4,
      arena_count: 0,
      zero_on_alloc: true,
      leak_detection: true,
      oom_policy: OomPolicy::Abort,
      memory_limit: None,
      spin_limit: DEFAULT_SPIN_LIMIT,
    }
  }
}

impl Config {
  /// Defaults overridden by `TESSERA_*` environment variables.
  ///
  /// A variable that is set but cannot be parsed is an error.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|name| env::var(name).ok())
  }

  /// Like [`Config::from_env`] with a custom variable source.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let mut config = Self::default();

    if let Some(val) = parse_var(&lookup, "TESSERA_BLOCK_SIZE_LOG", parse_usize)? {
      config.block_size_log = u32::try_from(val)
        .map_err(|_| Error::config(format!("TESSERA_BLOCK_SIZE_LOG={val} is out of range")))?;
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_BIG_THRESHOLD", parse_usize)? {
      config.big_threshold = Some(val);
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_ARENAS", parse_usize)? {
      config.arena_count = val;
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_CACHE_BLOCKS", parse_usize)? {
      config.cache_capacity = val;
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_ZERO_ON_ALLOC", parse_bool)? {
      config.zero_on_alloc = val;
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_LEAK_DETECTION", parse_bool)? {
      config.leak_detection = val;
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_MEMORY_LIMIT", parse_usize)? {
      config.memory_limit = (val != 0).then_some(val);
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_OOM", parse_oom)? {
      config.oom_policy = val;
    }
    if let Some(val) = parse_var(&lookup, "TESSERA_SPIN_LIMIT", parse_usize)? {
      config.spin_limit = u32::try_from(val).unwrap_or(u32::MAX);
    }

    config.validate()?;
    Ok(config)
  }

  #[inline]
  pub fn block_size(&self) -> usize {
    1 << self.block_size_log
  }

  /// Big-allocation threshold after applying the default.
  pub fn resolved_big_threshold(&self) -> usize {
    self.big_threshold.unwrap_or(self.block_size() / 4)
  }

  /// Slot sizes after applying the default progression.
  pub fn resolved_size_classes(&self) -> Vec<usize> {
    match &self.size_classes {
      Some(sizes) => sizes.clone(),
      None => geometric_sizes(self.resolved_big_threshold()),
    }
  }

  /// Number of arenas after applying the default.
  pub fn resolved_arena_count(&self) -> usize {
    let count = match self.arena_count {
      0 => thread::available_parallelism().map_or(1, |n| n.get()),
      n => n,
    };
    count.min(MAX_ARENAS)
  }

  /// Checks the fields that do not depend on the size-class table.
  pub fn validate(&self) -> Result<()> {
    if !(MIN_BLOCK_SIZE_LOG..=MAX_BLOCK_SIZE_LOG).contains(&self.block_size_log) {
      return Err(Error::config(format!(
        "block_size_log {} is outside {MIN_BLOCK_SIZE_LOG}..={MAX_BLOCK_SIZE_LOG}",
        self.block_size_log
      )));
    }
    if self.block_size() < page_size() {
      return Err(Error::config(format!(
        "block size {} is smaller than the page size {}",
        self.block_size(),
        page_size()
      )));
    }
    if self.arena_count > MAX_ARENAS {
      return Err(Error::config(format!(
        "{} arenas requested, at most {MAX_ARENAS} supported",
        self.arena_count
      )));
    }
    if self.memory_limit == Some(0) {
      return Err(Error::config("memory_limit must be non-zero (use None for unlimited)"));
    }
    Ok(())
  }
}

fn parse_var<T>(
  lookup: &impl Fn(&str) -> Option<String>,
  name: &str,
  parse: fn(&str) -> Option<T>,
) -> Result<Option<T>> {
  match lookup(name) {
    None => Ok(None),
    Some(raw) => parse(raw.trim())
      .map(Some)
      .ok_or_else(|| Error::config(format!("cannot parse {name}={raw:?}"))),
  }
}

fn parse_usize(s: &str) -> Option<usize> {
  s.parse().ok()
}

fn parse_bool(s: &str) -> Option<bool> {
  match s.to_lowercase().as_str() {
    "true" | "1" | "yes" | "on" => Some(true),
    "false" | "0" | "no" | "off" => Some(false),
    _ => None,
  }
}

fn parse_oom(s: &str) -> Option<OomPolicy> {
  match s.to_lowercase().as_str() {
    "abort" => Some(OomPolicy::Abort),
    "error" | "return" => Some(OomPolicy::ReturnError),
    _ => None,
  }
}
