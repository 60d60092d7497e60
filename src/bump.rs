use std::{mem, ptr::NonNull};

use tracing::trace;

use crate::{
  TINY_PAGE_SIZE,
  align::align_up,
  align_to,
  error::{AllocError, Result},
  page::page_size,
  raw::{RawAlloc, check_layout},
};

/// Monotonic allocator carving requests out of blocks obtained from a
/// block source.
///
/// Individual frees are ignored; memory comes back only when the owning
/// node resets or is torn down. Each new block is twice the size of the
/// previous one until the page size is reached.
pub struct BumpAllocator {
  current: usize,
  end: usize,
  next_block_size: usize,
}

impl BumpAllocator {
  pub const fn new() -> Self {
    Self {
      current: 0,
      end: 0,
      next_block_size: TINY_PAGE_SIZE,
    }
  }

  pub fn alloc(
    &mut self,
    blocks: &mut dyn RawAlloc,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    check_layout(len, align)?;
    if len == 0 {
      return NonNull::new(align as *mut u8).ok_or(AllocError::InvalidLayout);
    }

    if let Some(ptr) = self.try_alloc(len, align) {
      return Ok(ptr);
    }

    self.alloc_slow(blocks, len, align)
  }

  #[inline]
  fn try_alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Option<NonNull<u8>> {
    if self.current == 0 {
      return None;
    }
    let start = align_up(self.current, align)?;
    let new_current = start.checked_add(len)?;

    if new_current <= self.end {
      self.current = new_current;
      NonNull::new(start as *mut u8)
    } else {
      None
    }
  }

  fn alloc_slow(
    &mut self,
    blocks: &mut dyn RawAlloc,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    let needed = len.checked_add(align - 1).ok_or(AllocError::InvalidLayout)?;
    let size = self.block_size_for(needed);
    let block_align = align.max(mem::align_of::<usize>());

    let block = blocks.alloc(size, block_align)?;
    self.current = block.as_ptr() as usize;
    self.end = self.current + size;
    self.next_block_size = (self.next_block_size * 2).min(page_size());
    trace!(?block, size, next = self.next_block_size, "bump allocator new block");

    match self.try_alloc(len, align) {
      Some(ptr) => Ok(ptr),
      None => unreachable!("fresh bump block of {size} bytes cannot fit {len}"),
    }
  }

  fn block_size_for(
    &self,
    needed: usize,
  ) -> usize {
    let page = page_size();
    if needed <= self.next_block_size {
      self.next_block_size
    } else if needed < page {
      needed.next_power_of_two()
    } else {
      (align_to!(needed, page) / page).next_power_of_two() * page
    }
  }

  /// Bytes left in the current block.
  #[inline]
  pub fn remaining(&self) -> usize {
    self.end.saturating_sub(self.current)
  }

  /// Size the next block request will use (before fitting `len`).
  pub fn next_block_size(&self) -> usize {
    self.next_block_size
  }
}

impl Default for BumpAllocator {
  fn default() -> Self {
    Self::new()
  }
}
