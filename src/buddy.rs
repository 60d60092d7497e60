//! Binary buddy allocation over an abstract set of free lists.
//!
//! ```text
//!   class:      0      1       2        ...   top (= fallback)
//!   size:     2^min  2^min+1  2^min+2         2^max
//!
//!   alloc(3 * 2^min):                 free(a):
//!     class 2 empty -> split upward     buddy(a) = a ^ size(class)
//!     ┌───────────────┐                 buddy free?  merge, class += 1
//!     │ a     │ a+4   │ -> push a+4     reached top? give back to fallback
//!     └───────────────┘
//! ```
//!
//! Both the [`TinyPageAllocator`](crate::TinyPageAllocator) and the per-node
//! [`GeneralPurposeAllocator`](crate::GeneralPurposeAllocator) run these
//! routines; they differ only in how their free lists are stored.

use std::ptr::NonNull;

use tracing::trace;

use crate::{
  align::{is_aligned, log2_ceil},
  error::{AllocError, Result},
};

/// Free-list storage and fallback for [`alloc`] and [`free`].
///
/// Class `c` holds free blocks of `1 << (min_block_log2() + c)` bytes. The
/// classes run from `0` up to (excluding) `class_count()`; the block size of
/// `class_count()` itself is what the fallback hands out.
pub trait FreeListContext {
  fn min_block_log2(&self) -> u32;

  fn max_block_log2(&self) -> u32;

  fn list(
    &self,
    class: usize,
  ) -> &[usize];

  fn is_list_full(
    &self,
    class: usize,
  ) -> bool;

  fn is_list_empty(
    &self,
    class: usize,
  ) -> bool {
    self.list(class).is_empty()
  }

  /// Makes room for one push into `class`. Fixed-capacity lists can only
  /// refuse; growable lists may allocate here.
  fn reserve(
    &mut self,
    class: usize,
  ) -> Result<()> {
    if self.is_list_full(class) {
      Err(AllocError::FreeListFull { class })
    } else {
      Ok(())
    }
  }

  fn push_block(
    &mut self,
    addr: usize,
    class: usize,
  ) -> Result<()>;

  fn pop_block(
    &mut self,
    class: usize,
  ) -> Option<usize>;

  fn swap_remove(
    &mut self,
    class: usize,
    idx: usize,
  ) -> usize;

  fn fallback_alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>>;

  /// # Safety
  ///
  /// Same contract as [`RawAlloc::free`](crate::RawAlloc::free).
  unsafe fn fallback_free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  );

  #[inline]
  fn class_count(&self) -> usize {
    (self.max_block_log2() - self.min_block_log2()) as usize
  }
}

/// Size class serving `len`, or `None` when it belongs to the fallback.
#[inline]
pub fn class_for<C: FreeListContext + ?Sized>(
  ctx: &C,
  len: usize,
) -> Option<usize> {
  let size_log2 = log2_ceil(len).max(ctx.min_block_log2());
  if size_log2 >= ctx.max_block_log2() {
    None
  } else {
    Some((size_log2 - ctx.min_block_log2()) as usize)
  }
}

pub fn alloc<C: FreeListContext + ?Sized>(
  ctx: &mut C,
  len: usize,
  align: usize,
) -> Result<NonNull<u8>> {
  // Blocks are aligned to their size, so the class must cover `align` too.
  let Some(class) = class_for(ctx, len.max(align)) else {
    return ctx.fallback_alloc(len, align);
  };
  let min = ctx.min_block_log2();

  if let Some(addr) = ctx.pop_block(class) {
    return Ok(block_ptr(addr));
  }

  let top = ctx.class_count();
  let mut source = class + 1;
  while source < top && ctx.is_list_empty(source) {
    source += 1;
  }

  // Every class below `source` receives one split half.
  for c in class..source {
    ctx.reserve(c)?;
  }

  let block = if source == top {
    let max_size = 1usize << ctx.max_block_log2();
    let addr = ctx.fallback_alloc(max_size, max_size)?.as_ptr() as usize;
    debug_assert!(is_aligned(addr, max_size), "fallback block {addr:#x} is misaligned");
    addr
  } else {
    match ctx.pop_block(source) {
      Some(addr) => addr,
      None => unreachable!("free list {source} emptied during search"),
    }
  };

  for c in (class..source).rev() {
    let half = 1usize << (min as usize + c);
    ctx.push_block(block + half, c)?;
  }
  trace!(len, class, source, "buddy split");

  Ok(block_ptr(block))
}

/// # Safety
///
/// `ptr` must have been returned by [`alloc`] on the same context with the
/// same `len` and `align`, and must not be freed twice.
///
/// # Panics
///
/// On a double free, or when the merged block cannot be recorded in its
/// free list (a full fixed list, or a growable list whose storage cannot be
/// obtained).
pub unsafe fn free<C: FreeListContext + ?Sized>(
  ctx: &mut C,
  ptr: NonNull<u8>,
  len: usize,
  align: usize,
) {
  let Some(mut class) = class_for(ctx, len.max(align)) else {
    unsafe { ctx.fallback_free(ptr, len, align) };
    return;
  };
  let min = ctx.min_block_log2() as usize;
  let top = ctx.class_count();
  let mut addr = ptr.as_ptr() as usize;

  while class < top {
    let size = 1usize << (min + class);
    let buddy = addr ^ size;
    let mut buddy_idx = None;
    for (idx, &free_addr) in ctx.list(class).iter().enumerate() {
      if free_addr == addr {
        panic!("double free of {addr:#x} detected in size class {class}");
      }
      if free_addr == buddy {
        buddy_idx = Some(idx);
      }
    }
    let Some(idx) = buddy_idx else {
      break;
    };
    ctx.swap_remove(class, idx);
    addr = addr.min(buddy);
    class += 1;
  }

  if class == top {
    let max_size = 1usize << ctx.max_block_log2();
    unsafe { ctx.fallback_free(block_ptr(addr), max_size, max_size) };
    return;
  }

  if let Err(err) = ctx.push_block(addr, class) {
    panic!("cannot record freed block {addr:#x} in size class {class}: {err}");
  }
}

#[inline]
fn block_ptr(addr: usize) -> NonNull<u8> {
  match NonNull::new(addr as *mut u8) {
    Some(ptr) => ptr,
    None => unreachable!("buddy block at null address"),
  }
}
