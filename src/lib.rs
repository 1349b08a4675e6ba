//! Concurrent fixed-size block allocator.
//!
//! Every participating thread owns a private cache of free blocks. Threads
//! only meet on a lock-free shared pool of ready-made lists of
//! `list_length` blocks: once when their cache runs dry, and once every
//! `list_length` frees when it overflows. Backing buffers are carved into
//! exactly one list each and are only released by [`BlockAllocator::clear`].
//!
//! ```
//! use blockalloc::{BlockAllocator, BlockAllocatorConfig};
//!
//! let pool = BlockAllocator::with_config(BlockAllocatorConfig::new(48).with_list_length(64)).unwrap();
//! let block = pool.alloc();
//! assert_eq!(pool.num_used_blocks(), 1);
//! unsafe { pool.free(block) };
//! assert_eq!(pool.num_used_blocks(), 0);
//! ```
#![allow(clippy::missing_safety_doc)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("blockalloc supports only 64-bit targets.");

use core::{
  alloc::Layout,
  cell::{RefCell, UnsafeCell},
  fmt,
  marker::PhantomData,
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};
use std::sync::{Mutex, PoisonError};

use portable_atomic::AtomicU128;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Constants
// =============================================================================

/// Byte budget of one backing buffer when `list_length` is not given.
pub const DEFAULT_LIST_BYTES: usize = (1 << 18) - 64;

/// Byte budget used to derive `max_blocks` when it is not given.
pub const DEFAULT_MAX_BYTES: usize = 1_000_000_000_000;

/// Worker slots of the default [`ThreadSlots`] provider.
pub const DEFAULT_MAX_WORKERS: usize = 256;

/// Block alignment when none is requested (`max_align_t` on common targets).
const NATURAL_ALIGN: usize = 16;

/// Backing buffers never start below this alignment (two cache lines).
const MIN_BUFFER_ALIGN: usize = 128;

/// Smallest block: one forwarding link.
const LINK_SIZE: usize = size_of::<Block>();

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(NATURAL_ALIGN.is_power_of_two());
const _: () = assert!(MIN_BUFFER_ALIGN.is_power_of_two());
const _: () = assert!(MIN_BUFFER_ALIGN >= NATURAL_ALIGN);
const _: () = assert!(LINK_SIZE == size_of::<usize>());
const _: () = assert!(DEFAULT_LIST_BYTES >= LINK_SIZE);
#[cfg(feature = "padding")]
const _: () = assert!(size_of::<LocalCache>() == 128);

// =============================================================================
// Types
// =============================================================================

/// A free block. The first word links to the next free block; while the
/// block is handed out the allocator never touches it.
#[repr(C)]
struct Block {
  next: *mut Block,
}

/// Raw storage handed out by [`BlockAllocator::alloc`].
///
/// A handle is only an address: `block_size` bytes aligned to `block_align`,
/// uninitialized. Turning it into a typed pointer is up to the caller
/// ([`TypeAllocator`] does it for a single type).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BlockHandle(NonNull<u8>);

// A handle carries no ownership of its own; the block is exclusively the
// client's until it is freed, from whichever thread.
unsafe impl Send for BlockHandle {}
unsafe impl Sync for BlockHandle {}

impl BlockHandle {
  /// Wraps a pointer previously obtained from [`BlockHandle::as_non_null`].
  #[inline]
  pub const fn from_non_null(ptr: NonNull<u8>) -> Self {
    Self(ptr)
  }

  #[inline]
  pub const fn as_non_null(self) -> NonNull<u8> {
    self.0
  }

  #[inline]
  pub const fn as_ptr(self) -> *mut u8 {
    self.0.as_ptr()
  }

  #[inline]
  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  /// Reinterprets the storage as a `T`. Nothing is initialized.
  #[inline]
  pub const fn cast<T>(self) -> NonNull<T> {
    self.0.cast()
  }
}

impl fmt::Debug for BlockHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "BlockHandle({:p})", self.0)
  }
}

/// Rejected [`BlockAllocatorConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
  #[error("block alignment {0} is not a power of two")]
  AlignNotPowerOfTwo(usize),
  #[error("block of {size} bytes aligned to {align} does not fit the address space")]
  BlockTooLarge { size: usize, align: usize },
  #[error("backing buffer of {list_length} blocks of {block_size} bytes does not fit the address space")]
  BufferTooLarge { list_length: usize, block_size: usize },
}

/// Construction parameters of a [`BlockAllocator`].
///
/// A zero in `block_align`, `list_length` or `max_blocks` picks the default:
/// natural alignment, a list of roughly [`DEFAULT_LIST_BYTES`], and a ceiling
/// of [`DEFAULT_MAX_BYTES`] worth of blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockAllocatorConfig {
  pub block_size: usize,
  pub block_align: usize,
  /// Blocks to pre-carve into the shared pool at construction.
  pub reserved_blocks: usize,
  /// Blocks per backing buffer and per cache/pool transfer.
  pub list_length: usize,
  /// Hard ceiling on blocks ever carved.
  pub max_blocks: usize,
}

impl BlockAllocatorConfig {
  pub const fn new(block_size: usize) -> Self {
    Self {
      block_size,
      block_align: 0,
      reserved_blocks: 0,
      list_length: 0,
      max_blocks: 0,
    }
  }

  pub const fn with_block_align(mut self, block_align: usize) -> Self {
    self.block_align = block_align;
    self
  }

  pub const fn with_reserved_blocks(mut self, reserved_blocks: usize) -> Self {
    self.reserved_blocks = reserved_blocks;
    self
  }

  pub const fn with_list_length(mut self, list_length: usize) -> Self {
    self.list_length = list_length;
    self
  }

  pub const fn with_max_blocks(mut self, max_blocks: usize) -> Self {
    self.max_blocks = max_blocks;
    self
  }

  fn resolve(self) -> Result<Geometry, ConfigError> {
    let requested = if self.block_align == 0 {
      NATURAL_ALIGN
    } else {
      self.block_align
    };
    if !requested.is_power_of_two() {
      return Err(ConfigError::AlignNotPowerOfTwo(requested));
    }

    // Every block holds a link while free, so it must be aligned for one.
    let block_align = requested.max(align_of::<Block>());
    let buffer_align = block_align.max(MIN_BUFFER_ALIGN);
    let too_large = ConfigError::BlockTooLarge {
      size: self.block_size,
      align: block_align,
    };
    let block_size = self
      .block_size
      .max(LINK_SIZE)
      .checked_next_multiple_of(block_align)
      .ok_or(too_large.clone())?;
    if Layout::from_size_align(block_size, buffer_align).is_err() {
      return Err(too_large);
    }

    let list_length = if self.list_length == 0 {
      (DEFAULT_LIST_BYTES + block_size + 1) / block_size
    } else {
      self.list_length
    };
    let fits = list_length
      .checked_mul(block_size)
      .is_some_and(|bytes| Layout::from_size_align(bytes, buffer_align).is_ok());
    if !fits {
      return Err(ConfigError::BufferTooLarge {
        list_length,
        block_size,
      });
    }

    let max_blocks = if self.max_blocks == 0 {
      DEFAULT_MAX_BYTES / block_size
    } else {
      self.max_blocks
    };

    Ok(Geometry {
      block_size,
      block_align,
      buffer_align,
      list_length,
      max_blocks,
    })
  }
}

struct Geometry {
  block_size: usize,
  block_align: usize,
  buffer_align: usize,
  list_length: usize,
  max_blocks: usize,
}

/// Point-in-time counters of one allocator. Fields may disagree slightly
/// when taken while other threads allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
  pub used_blocks: usize,
  pub allocated_blocks: usize,
  pub block_size: usize,
  pub buffers: usize,
  pub pooled_lists: usize,
}

impl AllocatorStats {
  pub const fn allocated_bytes(&self) -> usize {
    self.allocated_blocks * self.block_size
  }
}

impl fmt::Display for AllocatorStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Used: {}, allocated: {}, block size: {}, bytes: {}",
      self.used_blocks,
      self.allocated_blocks,
      self.block_size,
      self.allocated_bytes()
    )
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

fn page_size() -> usize {
  let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  usize::try_from(page).unwrap_or(4096)
}

// =============================================================================
// Worker identity
// =============================================================================

/// Small bounded integer naming the worker that is currently running.
///
/// The allocator indexes its local caches with it. An id only has to stay
/// put for one call of `with_current`; a scheduler that migrates tasks may
/// pass a different id on the next call.
///
/// # Safety
///
/// `with_current` must pass a value below `max_workers`, and no two threads
/// may be inside `with_current` with the same id at the same time. A thread
/// that gives up an id must do so with release semantics that the next
/// holder acquires.
pub unsafe trait WorkerId: Send + Sync {
  /// Exclusive upper bound on every id `with_current` passes.
  fn max_workers(&self) -> usize;

  /// Runs `f` with the id of the running worker, held until `f` returns.
  fn with_current<R>(&self, f: impl FnOnce(usize) -> R) -> R;
}

/// Default [`WorkerId`]: each OS thread leases a process-wide slot on first
/// use and hands it back when it exits, so ids stay dense.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadSlots {
  max_workers: usize,
}

impl ThreadSlots {
  pub const fn new(max_workers: usize) -> Self {
    Self { max_workers }
  }
}

impl Default for ThreadSlots {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_WORKERS)
  }
}

unsafe impl WorkerId for ThreadSlots {
  #[inline]
  fn max_workers(&self) -> usize {
    self.max_workers
  }

  #[inline]
  fn with_current<R>(&self, f: impl FnOnce(usize) -> R) -> R {
    let run = |slot: usize| {
      debug_assert!(
        slot < self.max_workers,
        "thread slot {slot} exceeds the {} supported workers",
        self.max_workers
      );
      f(slot)
    };

    match thread_slot() {
      Some(slot) => run(slot),
      // Thread-local destructors may outlive the lease. Borrow a slot for
      // this one call and hand it straight back.
      None => {
        let lease = SlotLease::acquire();
        run(lease.0)
      }
    }
  }
}

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
static FREED_SLOTS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

struct SlotLease(usize);

impl SlotLease {
  fn acquire() -> Self {
    let recycled = FREED_SLOTS
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .pop();
    Self(recycled.unwrap_or_else(|| NEXT_SLOT.fetch_add(1, Ordering::Relaxed)))
  }
}

impl Drop for SlotLease {
  fn drop(&mut self) {
    FREED_SLOTS
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(self.0);
  }
}

thread_local! {
  static SLOT: SlotLease = SlotLease::acquire();
}

/// Slot leased by the calling thread, or `None` once the thread is tearing
/// down its thread-locals and the lease is gone.
#[inline]
pub fn thread_slot() -> Option<usize> {
  SLOT.try_with(|lease| lease.0).ok()
}

// =============================================================================
// Buffer Registry
// =============================================================================

/// One mapping carved into a single list of blocks.
struct Buffer {
  /// Start of the mapping as returned by mmap.
  raw: NonNull<u8>,
  mapped: usize,
  /// First block, aligned to the buffer alignment.
  blocks: NonNull<u8>,
  bytes: usize,
}

impl Buffer {
  /// Maps `bytes` aligned to `align`. Running out of memory does not return.
  fn map(bytes: usize, align: usize) -> Self {
    // mmap is page aligned; over-map only when that is not enough.
    let mapped = if align <= page_size() {
      bytes
    } else {
      bytes + align
    };
    let Some(raw) = NonNull::new(unsafe { os_mmap(mapped) }) else {
      error!(bytes, align, "backing buffer mmap failed");
      match Layout::from_size_align(bytes, align) {
        Ok(layout) => std::alloc::handle_alloc_error(layout),
        Err(_) => panic!("backing buffer mmap failed"),
      }
    };

    let offset = align_up(raw.as_ptr() as usize, align) - raw.as_ptr() as usize;
    let blocks = unsafe { NonNull::new_unchecked(raw.as_ptr().add(offset)) };
    Self {
      raw,
      mapped,
      blocks,
      bytes,
    }
  }

  #[inline]
  fn holds(&self, addr: usize) -> bool {
    let base = self.blocks.as_ptr() as usize;
    addr >= base && addr < base + self.bytes
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    unsafe { os_munmap(self.raw.as_ptr(), self.mapped) };
  }
}

struct Entry<T> {
  value: T,
  next: *mut Entry<T>,
}

/// Push-only lock-free list of boxed records. Records keep their address
/// until [`Registry::drain`], which needs exclusive access to the owner.
struct Registry<T> {
  head: AtomicPtr<Entry<T>>,
  len: AtomicUsize,
}

impl<T> Registry<T> {
  const fn new() -> Self {
    Self {
      head: AtomicPtr::new(null_mut()),
      len: AtomicUsize::new(0),
    }
  }

  fn register(&self, value: T) -> NonNull<T> {
    let entry = Box::into_raw(Box::new(Entry {
      value,
      next: null_mut(),
    }));

    let mut head = self.head.load(Ordering::Relaxed);
    loop {
      unsafe { (*entry).next = head };
      match self
        .head
        .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => break,
        Err(current) => head = current,
      }
    }
    self.len.fetch_add(1, Ordering::Relaxed);

    unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*entry).value)) }
  }

  fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  fn iter(&self) -> impl Iterator<Item = &T> + '_ {
    let mut cursor = self.head.load(Ordering::Acquire);
    core::iter::from_fn(move || {
      // Entries are only freed by `drain`, which excludes readers.
      let entry = unsafe { cursor.as_ref() }?;
      cursor = entry.next;
      Some(&entry.value)
    })
  }

  /// Drops every record and returns how many there were.
  ///
  /// Caller must guarantee no concurrent access and no outstanding pointer
  /// from `register`.
  unsafe fn drain(&self) -> usize {
    let mut cursor = self.head.swap(null_mut(), Ordering::Acquire);
    self.len.store(0, Ordering::Relaxed);

    let mut drained = 0;
    while !cursor.is_null() {
      let entry = unsafe { Box::from_raw(cursor) };
      cursor = entry.next;
      drained += 1;
    }
    drained
  }

  /// Forgets every record without dropping it.
  fn leak(&mut self) {
    *self.head.get_mut() = null_mut();
    *self.len.get_mut() = 0;
  }
}

impl<T> Drop for Registry<T> {
  fn drop(&mut self) {
    unsafe { self.drain() };
  }
}

// =============================================================================
// Shared Pool
// =============================================================================

/// Pool node carrying one list of exactly `list_length` blocks.
///
/// Carriers live in a [`Registry`] and are recycled, never freed, until the
/// allocator is cleared: a pop that loses a race may still read `next` of a
/// carrier someone else already took, and that read must stay in bounds.
struct Batch {
  next: AtomicPtr<Batch>,
  head: AtomicPtr<Block>,
}

impl Batch {
  const fn new() -> Self {
    Self {
      next: AtomicPtr::new(null_mut()),
      head: AtomicPtr::new(null_mut()),
    }
  }
}

/// Stack top paired with a generation for double-width CAS:
///
/// ```text
///   bits [127:64]  generation (bumped by every successful push and pop)
///   bits [63:0]    pointer
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedPtr(u128);

impl TaggedPtr {
  const NULL: Self = Self(0);

  #[inline]
  fn new(ptr: *mut Batch, generation: u64) -> Self {
    Self(u128::from(generation) << 64 | (ptr as usize as u128))
  }

  #[inline]
  fn ptr(self) -> *mut Batch {
    (self.0 as usize) as *mut Batch
  }

  #[inline]
  fn generation(self) -> u64 {
    (self.0 >> 64) as u64
  }
}

impl fmt::Debug for TaggedPtr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "TaggedPtr({:p}, gen={})", self.ptr(), self.generation())
  }
}

/// ABA-safe Treiber stack of carriers.
struct BatchStack {
  top: AtomicU128,
  /// Raised before a push lands and lowered after a pop lands, so it never
  /// undercounts.
  len: AtomicUsize,
}

impl BatchStack {
  const fn new() -> Self {
    Self {
      top: AtomicU128::new(TaggedPtr::NULL.0),
      len: AtomicUsize::new(0),
    }
  }

  fn push(&self, batch: NonNull<Batch>) {
    self.len.fetch_add(1, Ordering::Relaxed);

    let mut old = TaggedPtr(self.top.load(Ordering::Relaxed));
    loop {
      unsafe { batch.as_ref() }
        .next
        .store(old.ptr(), Ordering::Relaxed);
      let new = TaggedPtr::new(batch.as_ptr(), old.generation().wrapping_add(1));
      match self
        .top
        .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => return,
        Err(current) => old = TaggedPtr(current),
      }
    }
  }

  fn pop(&self) -> Option<NonNull<Batch>> {
    let mut old = TaggedPtr(self.top.load(Ordering::Acquire));
    loop {
      let top = NonNull::new(old.ptr())?;
      // Carriers outlive every pop, see `Batch`.
      let next = unsafe { top.as_ref() }.next.load(Ordering::Relaxed);
      let new = TaggedPtr::new(next, old.generation().wrapping_add(1));
      match self
        .top
        .compare_exchange_weak(old.0, new.0, Ordering::Acquire, Ordering::Acquire)
      {
        Ok(_) => {
          self.len.fetch_sub(1, Ordering::Relaxed);
          return Some(top);
        }
        Err(current) => old = TaggedPtr(current),
      }
    }
  }

  fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  /// Empties the stack. Caller must guarantee no concurrent access.
  unsafe fn clear(&self) {
    self.top.store(TaggedPtr::NULL.0, Ordering::Relaxed);
    self.len.store(0, Ordering::Relaxed);
  }
}

// =============================================================================
// Local Cache
// =============================================================================

struct LocalList {
  head: *mut Block,
  /// Boundary marker: everything after it is the next batch to hand back.
  mid: *mut Block,
}

impl LocalList {
  const EMPTY: Self = Self {
    head: null_mut(),
    mid: null_mut(),
  };
}

/// Free blocks private to one worker slot.
///
/// `len` is atomic only so that introspection can read it from other
/// threads; it is written solely by the slot owner.
#[cfg_attr(feature = "padding", repr(C, align(128)))]
struct LocalCache {
  len: AtomicUsize,
  list: UnsafeCell<LocalList>,
}

impl LocalCache {
  const fn new() -> Self {
    Self {
      len: AtomicUsize::new(0),
      list: UnsafeCell::new(LocalList::EMPTY),
    }
  }

  #[inline]
  fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  /// Caller must own the slot and the cache must be empty.
  #[inline]
  unsafe fn install(&self, head: NonNull<Block>, len: usize) {
    debug_assert_eq!(self.len(), 0, "installing a list over a non-empty cache");
    let list = unsafe { &mut *self.list.get() };
    list.head = head.as_ptr();
    list.mid = null_mut();
    self.len.store(len, Ordering::Relaxed);
  }

  /// Caller must own the slot and the cache must not be empty.
  #[inline]
  unsafe fn pop(&self) -> NonNull<Block> {
    let list = unsafe { &mut *self.list.get() };
    let len = self.len();
    debug_assert!(len > 0 && !list.head.is_null(), "pop from an empty local cache");

    let block = list.head;
    list.head = unsafe { (*block).next };
    self.len.store(len - 1, Ordering::Relaxed);
    unsafe { NonNull::new_unchecked(block) }
  }

  /// Links `block` as the new head. Once the cache reaches `2 * list_length`
  /// the oldest `list_length` blocks are detached and returned.
  ///
  /// Caller must own the slot and `block` must be free storage of the same
  /// allocator.
  #[inline]
  unsafe fn push(&self, block: NonNull<Block>, list_length: usize) -> Option<NonNull<Block>> {
    let list = unsafe { &mut *self.list.get() };
    let block = block.as_ptr();
    unsafe { block.write(Block { next: list.head }) };
    list.head = block;

    let mut len = self.len() + 1;
    // Both checks run: with a list length of one they fire together.
    if len == list_length + 1 {
      list.mid = block;
    }
    let mut batch = None;
    if len == 2 * list_length {
      let mid = list.mid;
      debug_assert!(!mid.is_null(), "boundary marker missing at split");
      unsafe {
        batch = NonNull::new((*mid).next);
        (*mid).next = null_mut();
      }
      list.mid = null_mut();
      len = list_length;
    }

    self.len.store(len, Ordering::Relaxed);
    batch
  }

  /// Caller must guarantee no concurrent access to the slot.
  unsafe fn reset(&self) {
    unsafe { *self.list.get() = LocalList::EMPTY };
    self.len.store(0, Ordering::Relaxed);
  }
}

// =============================================================================
// Block Allocator
// =============================================================================

/// Allocator of uniformly sized blocks for many threads.
///
/// `alloc` and `free` may be called from any number of threads at once.
/// `clear` needs exclusive access.
pub struct BlockAllocator<W: WorkerId = ThreadSlots> {
  workers: W,
  caches: Box<[LocalCache]>,
  /// Full lists of free blocks.
  pool: BatchStack,
  /// Carriers without a list, ready for the next push.
  spare: BatchStack,
  carriers: Registry<Batch>,
  buffers: Registry<Buffer>,
  block_size: usize,
  block_align: usize,
  buffer_align: usize,
  list_length: usize,
  max_blocks: usize,
  blocks_allocated: AtomicUsize,
}

// Caches are only touched by the worker owning their slot (see `WorkerId`);
// everything else is atomic.
unsafe impl<W: WorkerId> Send for BlockAllocator<W> {}
unsafe impl<W: WorkerId> Sync for BlockAllocator<W> {}

impl BlockAllocator {
  /// Allocator for `block_size` byte blocks with every other setting left at
  /// its default.
  ///
  /// # Panics
  ///
  /// Panics if a block of `block_size` bytes cannot be laid out.
  pub fn new(block_size: usize) -> Self {
    match Self::with_config(BlockAllocatorConfig::new(block_size)) {
      Ok(allocator) => allocator,
      Err(e) => panic!("invalid block allocator config: {e}"),
    }
  }

  /// # Errors
  ///
  /// Returns `ConfigError` if the alignment is not a power of two or the
  /// block or buffer size overflows.
  pub fn with_config(config: BlockAllocatorConfig) -> Result<Self, ConfigError> {
    Self::with_workers(config, ThreadSlots::default())
  }
}

impl<W: WorkerId> BlockAllocator<W> {
  /// Allocator whose local caches are indexed by `workers`.
  ///
  /// # Errors
  ///
  /// Returns `ConfigError` if the alignment is not a power of two or the
  /// block or buffer size overflows.
  pub fn with_workers(config: BlockAllocatorConfig, workers: W) -> Result<Self, ConfigError> {
    let geometry = config.resolve()?;
    let caches = (0..workers.max_workers())
      .map(|_| LocalCache::new())
      .collect();

    let allocator = Self {
      workers,
      caches,
      pool: BatchStack::new(),
      spare: BatchStack::new(),
      carriers: Registry::new(),
      buffers: Registry::new(),
      block_size: geometry.block_size,
      block_align: geometry.block_align,
      buffer_align: geometry.buffer_align,
      list_length: geometry.list_length,
      max_blocks: geometry.max_blocks,
      blocks_allocated: AtomicUsize::new(0),
    };
    debug!(
      block_size = allocator.block_size,
      block_align = allocator.block_align,
      list_length = allocator.list_length,
      max_blocks = allocator.max_blocks,
      max_workers = allocator.caches.len(),
      "block allocator created"
    );

    allocator.reserve(config.reserved_blocks);
    Ok(allocator)
  }

  /// Size of every block, after rounding.
  #[inline]
  pub fn block_size(&self) -> usize {
    self.block_size
  }

  /// Alignment every block is guaranteed to have. The cache-line minimum of
  /// 128 bytes applies to the base of each backing buffer, see
  /// [`buffer_align`](Self::buffer_align).
  #[inline]
  pub fn block_align(&self) -> usize {
    self.block_align
  }

  /// Alignment of each backing buffer's first block.
  #[inline]
  pub fn buffer_align(&self) -> usize {
    self.buffer_align
  }

  #[inline]
  pub fn list_length(&self) -> usize {
    self.list_length
  }

  #[inline]
  pub fn max_blocks(&self) -> usize {
    self.max_blocks
  }

  #[inline]
  pub fn max_workers(&self) -> usize {
    self.caches.len()
  }

  /// Blocks ever carved from backing buffers since creation or the last
  /// successful `clear`.
  #[inline]
  pub fn num_allocated_blocks(&self) -> usize {
    self.blocks_allocated.load(Ordering::Relaxed)
  }

  /// Blocks currently held by clients. A snapshot only when other threads
  /// are active.
  pub fn num_used_blocks(&self) -> usize {
    let pooled = self.pool.len() * self.list_length;
    let cached: usize = self.caches.iter().map(LocalCache::len).sum();
    self
      .num_allocated_blocks()
      .saturating_sub(pooled + cached)
  }

  pub fn stats(&self) -> AllocatorStats {
    AllocatorStats {
      used_blocks: self.num_used_blocks(),
      allocated_blocks: self.num_allocated_blocks(),
      block_size: self.block_size,
      buffers: self.buffers.len(),
      pooled_lists: self.pool.len(),
    }
  }

  pub fn log_stats(&self) {
    let stats = self.stats();
    info!(
      used = stats.used_blocks,
      allocated = stats.allocated_blocks,
      block_size = stats.block_size,
      bytes = stats.allocated_bytes(),
      "{stats}"
    );
  }

  /// Whether `ptr` is the start of a block inside one of this allocator's
  /// backing buffers. Walks every buffer.
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    self.buffers.iter().any(|buffer| {
      buffer.holds(addr) && (addr - buffer.blocks.as_ptr() as usize) % self.block_size == 0
    })
  }

  /// Returns `block_size` bytes of uninitialized storage aligned to
  /// `block_align`.
  ///
  /// # Panics
  ///
  /// Panics if carving a new buffer would exceed `max_blocks`. Running out of
  /// memory does not return.
  #[inline]
  pub fn alloc(&self) -> BlockHandle {
    let hit = self.workers.with_current(|id| {
      let cache = &self.caches[id];
      (cache.len() > 0).then(|| unsafe { cache.pop() })
    });
    if let Some(block) = hit {
      return BlockHandle(block.cast());
    }

    let list = self.get_list();

    // Getting a list may suspend the task and resume it on another worker
    // whose cache has been filled since. Never overwrite that cache.
    let block = self.workers.with_current(|id| {
      let cache = &self.caches[id];
      if cache.len() == 0 {
        unsafe { cache.install(list, self.list_length) };
      } else {
        trace!(worker = id, "worker changed during refill, list goes back to the pool");
        self.push_list(list);
      }
      unsafe { cache.pop() }
    });
    BlockHandle(block.cast())
  }

  /// Returns a block to the calling worker's cache, handing a full list to
  /// the shared pool every `list_length` frees once the cache is full.
  ///
  /// # Safety
  ///
  /// `block` must come from `alloc` on this allocator, must not have been
  /// freed since, and must not be used afterwards.
  #[inline]
  pub unsafe fn free(&self, block: BlockHandle) {
    debug_assert!(
      block.addr().is_multiple_of(self.block_align),
      "freed block {:p} is not aligned to {}",
      block.as_ptr(),
      self.block_align
    );
    #[cfg(feature = "debug-tripwire")]
    assert!(
      self.contains(block.as_ptr()),
      "freed block {:p} does not belong to this allocator",
      block.as_ptr()
    );

    let batch = self
      .workers
      .with_current(|id| unsafe { self.caches[id].push(block.0.cast(), self.list_length) });
    if let Some(batch) = batch {
      self.push_list(batch);
    }
  }

  /// Carves enough buffers that the shared pool holds lists for at least
  /// `n` allocations.
  pub fn reserve(&self, n: usize) {
    let wanted = n.div_ceil(self.list_length);
    let missing = wanted.saturating_sub(self.pool.len());
    for _ in 0..missing {
      let list = self.carve_list();
      self.push_list(list);
    }

    if missing > 0 {
      debug!(blocks = n, lists = missing, "reserved lists in the shared pool");
    }
  }

  /// Releases every backing buffer and resets all counters, leaving the
  /// allocator ready for reuse.
  ///
  /// Returns `false` and changes nothing if any block is still in use.
  pub fn clear(&mut self) -> bool {
    unsafe { self.clear_shared() }
  }

  /// [`clear`](Self::clear) through a shared reference, for allocators that
  /// live in statics.
  ///
  /// # Safety
  ///
  /// No other operation on this allocator may run concurrently, and no
  /// thread may use it until this returns.
  pub unsafe fn clear_shared(&self) -> bool {
    let used = self.num_used_blocks();
    if used > 0 {
      debug!(used, "clear refused, blocks still in use");
      return false;
    }

    for cache in self.caches.iter() {
      unsafe { cache.reset() };
    }
    unsafe {
      self.pool.clear();
      self.spare.clear();
    }
    let buffers = unsafe { self.buffers.drain() };
    unsafe { self.carriers.drain() };
    self.blocks_allocated.store(0, Ordering::Relaxed);

    debug!(buffers, block_size = self.block_size, "block allocator cleared");
    true
  }

  /// A full list from the pool, or a freshly carved one.
  fn get_list(&self) -> NonNull<Block> {
    match self.pop_list() {
      Some(list) => list,
      None => self.carve_list(),
    }
  }

  fn pop_list(&self) -> Option<NonNull<Block>> {
    let carrier = self.pool.pop()?;
    let head = unsafe { carrier.as_ref() }
      .head
      .swap(null_mut(), Ordering::Relaxed);
    self.spare.push(carrier);

    debug_assert!(!head.is_null(), "pooled carrier without a list");
    trace!(list = ?head, "list taken from the shared pool");
    NonNull::new(head)
  }

  fn push_list(&self, list: NonNull<Block>) {
    let carrier = self
      .spare
      .pop()
      .unwrap_or_else(|| self.carriers.register(Batch::new()));
    unsafe { carrier.as_ref() }
      .head
      .store(list.as_ptr(), Ordering::Relaxed);
    self.pool.push(carrier);
    trace!(list = ?list, "list handed to the shared pool");
  }

  /// Maps a new buffer and links its blocks into one list.
  #[inline(never)]
  fn carve_list(&self) -> NonNull<Block> {
    let carved = self
      .blocks_allocated
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        n.checked_add(self.list_length)
          .filter(|&total| total <= self.max_blocks)
      });
    let Ok(before) = carved else {
      panic!(
        "block allocator exceeded its ceiling of {} blocks",
        self.max_blocks
      );
    };
    let total = before + self.list_length;

    let buffer = Buffer::map(self.list_length * self.block_size, self.buffer_align);
    let base = buffer.blocks;
    self.buffers.register(buffer);
    trace!(
      base = ?base,
      blocks = self.list_length,
      total,
      "carved backing buffer"
    );

    unsafe { self.link_buffer(base) }
  }

  /// `base` must point to `list_length * block_size` unused bytes.
  unsafe fn link_buffer(&self, base: NonNull<u8>) -> NonNull<Block> {
    let base = base.as_ptr();
    for i in 0..self.list_length {
      let next = if i + 1 < self.list_length {
        unsafe { base.add((i + 1) * self.block_size) }.cast::<Block>()
      } else {
        null_mut()
      };
      unsafe { base.add(i * self.block_size).cast::<Block>().write(Block { next }) };
    }
    unsafe { NonNull::new_unchecked(base.cast()) }
  }
}

impl<W: WorkerId> fmt::Debug for BlockAllocator<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BlockAllocator")
      .field("block_size", &self.block_size)
      .field("block_align", &self.block_align)
      .field("list_length", &self.list_length)
      .field("max_blocks", &self.max_blocks)
      .field("stats", &self.stats())
      .finish()
  }
}

impl<W: WorkerId> Drop for BlockAllocator<W> {
  fn drop(&mut self) {
    // Live blocks keep their buffers: leak rather than pull memory from
    // under a client.
    if !self.clear() {
      warn!(
        used = self.num_used_blocks(),
        buffers = self.buffers.len(),
        "blocks still in use at teardown, leaking backing buffers"
      );
      self.buffers.leak();
    }
  }
}

// =============================================================================
// Typed Wrapper
// =============================================================================

type SharedAllocator = (usize, usize, &'static BlockAllocator);

static SHARED_ALLOCATORS: Mutex<Vec<SharedAllocator>> = Mutex::new(Vec::new());

thread_local! {
  static RECENT_ALLOCATORS: RefCell<Vec<SharedAllocator>> = const { RefCell::new(Vec::new()) };
}

/// Process-wide allocator for blocks of `size` bytes aligned to `align`,
/// created on first use and never dropped.
///
/// # Panics
///
/// Panics if `align` is not a power of two or the block cannot be laid out.
pub fn block_allocator_for(size: usize, align: usize) -> &'static BlockAllocator {
  let cached = RECENT_ALLOCATORS.try_with(|recent| {
    if let Some(&(_, _, allocator)) = recent
      .borrow()
      .iter()
      .find(|&&(s, a, _)| s == size && a == align)
    {
      return allocator;
    }

    let allocator = shared_allocator(size, align);
    recent.borrow_mut().push((size, align, allocator));
    allocator
  });

  // The per-thread cache is gone while the thread tears down.
  cached.unwrap_or_else(|_| shared_allocator(size, align))
}

#[inline(never)]
fn shared_allocator(size: usize, align: usize) -> &'static BlockAllocator {
  let mut shared = SHARED_ALLOCATORS
    .lock()
    .unwrap_or_else(PoisonError::into_inner);
  if let Some(&(_, _, allocator)) = shared.iter().find(|&&(s, a, _)| s == size && a == align) {
    return allocator;
  }

  let config = BlockAllocatorConfig::new(size).with_block_align(align);
  let allocator: &'static BlockAllocator = match BlockAllocator::with_config(config) {
    Ok(allocator) => Box::leak(Box::new(allocator)),
    Err(e) => panic!("no block allocator for {size} bytes aligned to {align}: {e}"),
  };
  shared.push((size, align, allocator));
  allocator
}

/// Headerless storage for single objects of type `T`, backed by the shared
/// [`block_allocator_for`] instance of `T`'s size and alignment.
///
/// `alloc`/`free` deal in uninitialized storage; `create`/`destroy` also
/// move a value in and drop it in place.
///
/// ```
/// use blockalloc::TypeAllocator;
///
/// let node = TypeAllocator::<(u64, u64)>::create((1, 2));
/// assert_eq!(unsafe { node.as_ref() }.1, 2);
/// unsafe { TypeAllocator::destroy(node) };
/// ```
pub struct TypeAllocator<T>(PhantomData<fn() -> T>);

impl<T> TypeAllocator<T> {
  #[inline]
  fn allocator() -> &'static BlockAllocator {
    block_allocator_for(size_of::<T>(), align_of::<T>())
  }

  /// Uninitialized storage for one `T`.
  #[inline]
  pub fn alloc() -> NonNull<T> {
    let block = Self::allocator().alloc();
    debug_assert!(block.addr().is_multiple_of(align_of::<T>()));
    block.cast()
  }

  /// Returns storage obtained from [`alloc`](Self::alloc) without dropping
  /// its contents.
  ///
  /// # Safety
  ///
  /// `ptr` must come from `alloc` or `create` of this type and not have been
  /// freed since.
  #[inline]
  pub unsafe fn free(ptr: NonNull<T>) {
    debug_assert!((ptr.as_ptr() as usize).is_multiple_of(align_of::<T>()));
    unsafe { Self::allocator().free(BlockHandle::from_non_null(ptr.cast())) };
  }

  /// Allocates storage and moves `value` into it.
  #[inline]
  pub fn create(value: T) -> NonNull<T> {
    let ptr = Self::alloc();
    unsafe { ptr.as_ptr().write(value) };
    ptr
  }

  /// Drops the object in place and frees its storage.
  ///
  /// # Safety
  ///
  /// `ptr` must come from `create` (or be an initialized `alloc`) of this
  /// type, not have been destroyed or freed, and not be used afterwards.
  #[inline]
  pub unsafe fn destroy(ptr: NonNull<T>) {
    unsafe {
      ptr::drop_in_place(ptr.as_ptr());
      Self::free(ptr);
    }
  }

  pub fn reserve(n: usize) {
    Self::allocator().reserve(n);
  }

  /// Clears the shared allocator behind `T`. Every type of the same size and
  /// alignment shares it.
  ///
  /// # Safety
  ///
  /// No thread may use any type backed by the same allocator concurrently.
  pub unsafe fn finish() -> bool {
    unsafe { Self::allocator().clear_shared() }
  }

  pub fn block_size() -> usize {
    Self::allocator().block_size()
  }

  pub fn num_allocated_blocks() -> usize {
    Self::allocator().num_allocated_blocks()
  }

  pub fn num_used_blocks() -> usize {
    Self::allocator().num_used_blocks()
  }

  pub fn num_used_bytes() -> usize {
    Self::num_used_blocks() * Self::block_size()
  }

  pub fn stats() -> AllocatorStats {
    Self::allocator().stats()
  }

  pub fn log_stats() {
    Self::allocator().log_stats();
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
