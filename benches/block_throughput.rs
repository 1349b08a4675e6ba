use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use blockalloc::{BlockAllocator, BlockHandle, TypeAllocator};

const OPS: u64 = 100_000;
const BATCH: usize = 4096;

/// One block in flight at a time.
fn block_alloc_free(pool: &BlockAllocator) {
  for _ in 0..OPS {
    let block = pool.alloc();
    black_box(block);
    unsafe { pool.free(block) };
  }
}

/// Enough blocks in flight that the cache spills to the shared pool and
/// refills from it.
fn block_alloc_free_batched(pool: &BlockAllocator, held: &mut Vec<BlockHandle>) {
  for _ in 0..OPS as usize / BATCH {
    for _ in 0..BATCH {
      held.push(pool.alloc());
    }
    for block in held.drain(..) {
      unsafe { pool.free(block) };
    }
  }
}

fn typed_create_destroy() {
  for i in 0..OPS {
    let node = TypeAllocator::<[u64; 4]>::create([i; 4]);
    black_box(node);
    unsafe { TypeAllocator::destroy(node) };
  }
}

fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_block_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("block_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));
    let pool = BlockAllocator::new(size);

    group.bench_with_input(BenchmarkId::new("blockalloc", size), &pool, |b, pool| {
      b.iter(|| block_alloc_free(pool))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_batched(c: &mut Criterion) {
  let mut group = c.benchmark_group("block_throughput_batched");
  group.throughput(Throughput::Elements(OPS));

  for list_length in [64, 1024] {
    let pool = BlockAllocator::with_config(
      blockalloc::BlockAllocatorConfig::new(64).with_list_length(list_length),
    )
    .unwrap();
    let mut held = Vec::with_capacity(BATCH);
    group.bench_function(BenchmarkId::new("list_length", list_length), |b| {
      b.iter(|| block_alloc_free_batched(&pool, &mut held))
    });
  }

  group.bench_function("type_allocator", |b| b.iter(typed_create_destroy));
  group.finish();
}

criterion_group!(benches, benchmark_block_throughput, benchmark_batched);
criterion_main!(benches);
