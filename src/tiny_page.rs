//! Sub-page allocation in power-of-two sizes from `TINY_PAGE_SIZE` up to
//! just below the OS page size.
//!
//! Free blocks of each class live in a fixed array of `CAP` slots, so the
//! allocator itself never allocates bookkeeping. Anything at or above the
//! page size goes straight to the fallback (normally [`OsPageAllocator`]).

use std::ptr::NonNull;

use tracing::debug;

use crate::{
  TINY_PAGE_LOG2,
  buddy::{self, FreeListContext},
  error::{AllocError, Result},
  page::{OsPageAllocator, page_size},
  raw::{RawAlloc, check_layout},
};

/// Enough classes for pages up to 64 KiB; larger pages are capped there.
pub const MAX_TINY_CLASSES: usize = 8;

pub const DEFAULT_TINY_CAPACITY: usize = 100;

pub struct TinyPageAllocator<F: RawAlloc = OsPageAllocator, const CAP: usize = DEFAULT_TINY_CAPACITY> {
  lists: [[usize; CAP]; MAX_TINY_CLASSES],
  counts: [usize; MAX_TINY_CLASSES],
  max_block_log2: u32,
  fallback: F,
}

impl TinyPageAllocator<OsPageAllocator, DEFAULT_TINY_CAPACITY> {
  pub fn new() -> Self {
    Self::with_fallback(OsPageAllocator::new())
  }
}

impl Default for TinyPageAllocator<OsPageAllocator, DEFAULT_TINY_CAPACITY> {
  fn default() -> Self {
    Self::new()
  }
}

impl<F: RawAlloc, const CAP: usize> TinyPageAllocator<F, CAP> {
  pub fn with_fallback(fallback: F) -> Self {
    let page_log2 = page_size().trailing_zeros();
    Self {
      lists: [[0; CAP]; MAX_TINY_CLASSES],
      counts: [0; MAX_TINY_CLASSES],
      max_block_log2: page_log2.clamp(TINY_PAGE_LOG2, TINY_PAGE_LOG2 + MAX_TINY_CLASSES as u32),
      fallback,
    }
  }

  /// Number of free blocks held per size class, smallest class first.
  pub fn free_counts(&self) -> Vec<usize> {
    self.counts[..self.class_count()].to_vec()
  }

  /// Bytes currently parked in the free lists.
  pub fn free_bytes(&self) -> usize {
    self
      .free_counts()
      .iter()
      .enumerate()
      .map(|(class, count)| count << (TINY_PAGE_LOG2 as usize + class))
      .sum()
  }

  pub fn fallback(&self) -> &F {
    &self.fallback
  }

  pub fn into_fallback(self) -> F {
    self.fallback
  }
}

impl<F: RawAlloc, const CAP: usize> FreeListContext for TinyPageAllocator<F, CAP> {
  fn min_block_log2(&self) -> u32 {
    TINY_PAGE_LOG2
  }

  fn max_block_log2(&self) -> u32 {
    self.max_block_log2
  }

  fn list(
    &self,
    class: usize,
  ) -> &[usize] {
    &self.lists[class][..self.counts[class]]
  }

  fn is_list_full(
    &self,
    class: usize,
  ) -> bool {
    self.counts[class] >= CAP
  }

  fn push_block(
    &mut self,
    addr: usize,
    class: usize,
  ) -> Result<()> {
    let count = self.counts[class];
    if count >= CAP {
      return Err(AllocError::FreeListFull { class });
    }
    self.lists[class][count] = addr;
    self.counts[class] = count + 1;
    Ok(())
  }

  fn pop_block(
    &mut self,
    class: usize,
  ) -> Option<usize> {
    let count = self.counts[class];
    if count == 0 {
      return None;
    }
    self.counts[class] = count - 1;
    Some(self.lists[class][count - 1])
  }

  fn swap_remove(
    &mut self,
    class: usize,
    idx: usize,
  ) -> usize {
    let count = self.counts[class];
    assert!(idx < count, "swap_remove index {idx} out of bounds ({count})");
    let list = &mut self.lists[class];
    let addr = list[idx];
    list[idx] = list[count - 1];
    self.counts[class] = count - 1;
    addr
  }

  fn fallback_alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    debug!(len, align, "tiny page allocator requesting pages");
    self.fallback.alloc(len, align)
  }

  unsafe fn fallback_free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    debug!(?ptr, len, "tiny page allocator returning pages");
    unsafe { self.fallback.free(ptr, len, align) }
  }
}

impl<F: RawAlloc, const CAP: usize> RawAlloc for TinyPageAllocator<F, CAP> {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    check_layout(len, align)?;
    buddy::alloc(self, len, align)
  }

  unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    unsafe { buddy::free(self, ptr, len, align) }
  }
}
