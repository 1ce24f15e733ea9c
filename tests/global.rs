//! The process-wide allocator. Kept to a single test: the singleton is shared
//! by everything in this binary.

use std::ptr;

use tessera::{Config, Error};

#[test]
fn process_wide_allocator_lifecycle() {
  let installed = tessera::init(Config {
    arena_count: 2,
    cache_capacity: 1,
    ..Config::default()
  })
  .unwrap();
  assert!(ptr::eq(installed, tessera::global()));
  assert_eq!(tessera::global().config().arena_count, 2);
  assert!(matches!(tessera::init(Config::default()), Err(Error::AlreadyInitialized)));

  let a = tessera::alloc(100).unwrap();
  let b = tessera::alloc(50_000).unwrap();
  unsafe {
    a.as_ptr().write_bytes(0x11, 100);
    let a = tessera::realloc(a.as_ptr(), 100, 1000, 100).unwrap();
    assert_eq!(*a.add(99), 0x11);
    assert_eq!(tessera::global().outstanding(), 2);
    tessera::free(a, 1000);
  }

  // One allocation is still live: reported, but stays usable.
  assert_eq!(tessera::shutdown(), 1);
  assert_eq!(tessera::global().stats().cached_blocks(), 0);
  unsafe {
    b.as_ptr().write(1);
    tessera::free(b.as_ptr(), 50_000);
  }
  assert_eq!(tessera::shutdown(), 0);
}
