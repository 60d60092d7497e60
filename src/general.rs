//! Per-node general-purpose allocator.
//!
//! Buddy allocation for blocks of 8 bytes up to just under
//! `TINY_PAGE_SIZE`; bigger requests go straight to the page source (the
//! node's block allocator). Free lists are grown on demand out of the page
//! source and handed back as soon as they drain.

use std::ptr::NonNull;

use crate::{
  GPA_MIN_LOG2, TINY_PAGE_LOG2, TINY_PAGE_SIZE,
  buddy::{self, FreeListContext},
  error::Result,
  list::PageList,
  raw::{RawAlloc, check_layout},
};

pub const GPA_CLASSES: usize = (TINY_PAGE_LOG2 - GPA_MIN_LOG2) as usize;

const LIST_CAPACITY: usize = PageList::<usize>::capacity_for(TINY_PAGE_SIZE);

pub struct GeneralPurposeAllocator {
  lists: [PageList<usize>; GPA_CLASSES],
}

impl GeneralPurposeAllocator {
  pub const fn new() -> Self {
    Self {
      lists: [const { PageList::new() }; GPA_CLASSES],
    }
  }

  pub fn alloc(
    &mut self,
    pages: &mut dyn RawAlloc,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    check_layout(len, align)?;
    let mut ctx = self.context(pages);
    let result = buddy::alloc(&mut ctx, len, align);
    if result.is_err() {
      // Lists reserved for a split that never happened.
      for class in 0..GPA_CLASSES {
        ctx.release_if_drained(class);
      }
    }
    result
  }

  /// # Safety
  ///
  /// `ptr` must come from [`alloc`](Self::alloc) with the same `len` and
  /// the same page source.
  pub unsafe fn free(
    &mut self,
    pages: &mut dyn RawAlloc,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    unsafe { buddy::free(&mut self.context(pages), ptr, len, align) }
  }

  /// Free blocks held per size class, smallest first.
  pub fn free_counts(&self) -> [usize; GPA_CLASSES] {
    std::array::from_fn(|class| self.lists[class].len())
  }

  /// Addresses of the free blocks in `class`.
  pub fn free_blocks(
    &self,
    class: usize,
  ) -> &[usize] {
    self.lists[class].as_slice()
  }

  /// Number of free lists currently holding backing storage.
  pub fn live_lists(&self) -> usize {
    self.lists.iter().filter(|list| list.capacity() != 0).count()
  }

  fn context<'a>(
    &'a mut self,
    pages: &'a mut dyn RawAlloc,
  ) -> GpaContext<'a> {
    GpaContext {
      lists: &mut self.lists,
      pages,
    }
  }
}

impl Default for GeneralPurposeAllocator {
  fn default() -> Self {
    Self::new()
  }
}

struct GpaContext<'a> {
  lists: &'a mut [PageList<usize>; GPA_CLASSES],
  pages: &'a mut dyn RawAlloc,
}

impl GpaContext<'_> {
  fn release_if_drained(
    &mut self,
    class: usize,
  ) {
    if self.lists[class].is_empty() {
      self.lists[class].clear_and_free(self.pages);
    }
  }
}

impl FreeListContext for GpaContext<'_> {
  fn min_block_log2(&self) -> u32 {
    GPA_MIN_LOG2
  }

  fn max_block_log2(&self) -> u32 {
    TINY_PAGE_LOG2
  }

  fn list(
    &self,
    class: usize,
  ) -> &[usize] {
    self.lists[class].as_slice()
  }

  fn is_list_full(
    &self,
    class: usize,
  ) -> bool {
    self.lists[class].is_full()
  }

  fn reserve(
    &mut self,
    class: usize,
  ) -> Result<()> {
    self.lists[class].reserve_one(self.pages, LIST_CAPACITY)
  }

  fn push_block(
    &mut self,
    addr: usize,
    class: usize,
  ) -> Result<()> {
    self.lists[class].push(self.pages, LIST_CAPACITY, addr)
  }

  fn pop_block(
    &mut self,
    class: usize,
  ) -> Option<usize> {
    let addr = self.lists[class].pop()?;
    self.release_if_drained(class);
    Some(addr)
  }

  fn swap_remove(
    &mut self,
    class: usize,
    idx: usize,
  ) -> usize {
    let addr = self.lists[class].swap_remove(idx);
    self.release_if_drained(class);
    addr
  }

  fn fallback_alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    self.pages.alloc(len, align)
  }

  unsafe fn fallback_free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    unsafe { self.pages.free(ptr, len, align) }
  }
}
