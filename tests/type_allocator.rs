// Types backed by the shared allocators are kept to distinct (size, align)
// pairs per test, since tests run in parallel.
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use blockalloc::{TypeAllocator, block_allocator_for};

static TRACKED_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Tracked {
  payload: [u64; 5],
  drops: &'static AtomicUsize,
}

impl Drop for Tracked {
  fn drop(&mut self) {
    self.drops.fetch_add(1, Ordering::Relaxed);
  }
}

#[repr(align(64))]
struct Aligned([u8; 64]);

struct Node {
  value: [u64; 11],
}

struct Chunk(#[allow(dead_code)] [u8; 72]);

#[test]
fn test_create_destroy_runs_drop() {
  let objects: Vec<_> = (0..100u64)
    .map(|i| {
      TypeAllocator::<Tracked>::create(Tracked {
        payload: [i; 5],
        drops: &TRACKED_DROPS,
      })
    })
    .collect();
  assert_eq!(TypeAllocator::<Tracked>::num_used_blocks(), 100);
  assert_eq!(
    TypeAllocator::<Tracked>::num_used_bytes(),
    100 * TypeAllocator::<Tracked>::block_size()
  );

  for (i, object) in objects.iter().enumerate() {
    assert_eq!(unsafe { object.as_ref() }.payload, [i as u64; 5]);
  }
  for object in objects {
    unsafe { TypeAllocator::destroy(object) };
  }
  assert_eq!(TRACKED_DROPS.load(Ordering::Relaxed), 100);
  assert_eq!(TypeAllocator::<Tracked>::num_used_blocks(), 0);
}

#[test]
fn test_alignment_of_type() {
  assert_eq!(TypeAllocator::<Aligned>::block_size(), 64);
  let blocks: Vec<_> = (0..50).map(|_| TypeAllocator::<Aligned>::alloc()).collect();
  for block in &blocks {
    assert_eq!(block.as_ptr() as usize % 64, 0);
  }
  for block in blocks {
    unsafe { TypeAllocator::free(block) };
  }
}

#[test]
fn test_small_types_get_a_link_sized_block() {
  assert_eq!(TypeAllocator::<u8>::block_size(), 8);
  assert_eq!(TypeAllocator::<()>::block_size(), 8);
}

#[test]
fn test_same_layout_shares_allocator() {
  assert!(ptr::eq(block_allocator_for(72, 1), block_allocator_for(72, 1)));
  let from_other_thread = thread::spawn(|| block_allocator_for(72, 1) as *const _ as usize)
    .join()
    .unwrap();
  assert_eq!(from_other_thread, block_allocator_for(72, 1) as *const _ as usize);

  let chunk = TypeAllocator::<Chunk>::create(Chunk([1; 72]));
  assert_eq!(TypeAllocator::<[u8; 72]>::num_used_blocks(), 1);
  unsafe { TypeAllocator::destroy(chunk) };
  assert_eq!(TypeAllocator::<[u8; 72]>::num_used_blocks(), 0);
}

#[test]
fn test_finish() {
  let node = TypeAllocator::<Node>::create(Node { value: [3; 11] });
  assert!(!unsafe { TypeAllocator::<Node>::finish() });
  assert_eq!(unsafe { node.as_ref() }.value, [3; 11]);

  unsafe { TypeAllocator::destroy(node) };
  assert!(unsafe { TypeAllocator::<Node>::finish() });
  assert_eq!(TypeAllocator::<Node>::num_allocated_blocks(), 0);

  // Fresh buffers after finishing.
  let node = TypeAllocator::<Node>::create(Node { value: [4; 11] });
  assert!(TypeAllocator::<Node>::num_allocated_blocks() > 0);
  unsafe { TypeAllocator::destroy(node) };
}

#[test]
fn test_reserve_and_threads() {
  type Pair = ([u64; 13], u32);

  TypeAllocator::<Pair>::reserve(1_000);
  let reserved = TypeAllocator::<Pair>::num_allocated_blocks();
  assert!(reserved >= 1_000);
  assert_eq!(TypeAllocator::<Pair>::stats().used_blocks, 0);

  thread::scope(|s| {
    for t in 0..4u32 {
      s.spawn(move || {
        for round in 0..200u32 {
          let pair = TypeAllocator::<Pair>::create(([u64::from(round); 13], t));
          assert_eq!(unsafe { pair.as_ref() }.1, t);
          unsafe { TypeAllocator::destroy(pair) };
        }
      });
    }
  });

  assert_eq!(TypeAllocator::<Pair>::num_used_blocks(), 0);
  TypeAllocator::<Pair>::log_stats();
}
