use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::{
  TINY_PAGE_SIZE,
  align::round_block_len,
  error::Result,
  list::PageList,
  page::page_size,
  raw::{RawAlloc, check_layout},
};

/// One block obtained from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
  pub ptr: NonNull<u8>,
  pub len: usize,
  pub align: usize,
}

impl Block {
  pub fn new(
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) -> Self {
    Self { ptr, len, align }
  }
}

/// Records every block handed out by an upstream allocator so that all of
/// them can be released in one pass.
///
/// The record list itself lives in upstream memory. The allocator does not
/// own its upstream; every call takes it, and the caller must always pass
/// the same one.
pub struct BlockAllocator {
  blocks: PageList<Block>,
}

impl BlockAllocator {
  /// An allocator with no record storage yet. Never fails.
  pub const fn empty() -> Self {
    Self {
      blocks: PageList::new(),
    }
  }

  /// An allocator with one tiny page worth of record slots reserved.
  pub fn new(upstream: &mut dyn RawAlloc) -> Result<Self> {
    Ok(Self {
      blocks: PageList::with_capacity(upstream, Self::initial_capacity())?,
    })
  }

  const fn initial_capacity() -> usize {
    PageList::<Block>::capacity_for(TINY_PAGE_SIZE)
  }

  pub fn alloc(
    &mut self,
    upstream: &mut dyn RawAlloc,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    check_layout(len, align)?;
    let rounded = round_block_len(len.max(align), page_size());

    self.blocks.reserve_one(upstream, Self::initial_capacity())?;
    let ptr = upstream.alloc(rounded, align)?;
    self
      .blocks
      .push(upstream, Self::initial_capacity(), Block::new(ptr, rounded, align))?;

    trace!(?ptr, len, rounded, "tracked block");
    Ok(ptr)
  }

  /// Returns a tracked block to upstream. The length is taken from the
  /// record, so callers may pass the length they originally asked for.
  ///
  /// # Safety
  ///
  /// `ptr` must not be used after this call.
  ///
  /// # Panics
  ///
  /// If `ptr` is not the base of a block tracked by this allocator.
  pub unsafe fn free(
    &mut self,
    upstream: &mut dyn RawAlloc,
    ptr: NonNull<u8>,
  ) {
    let Some(idx) = self.find_block(ptr) else {
      panic!("free of {ptr:?}, which is not a block of this allocator");
    };
    let block = self.blocks.swap_remove(idx);
    unsafe { upstream.free(block.ptr, block.len, block.align) };
    trace!(?ptr, len = block.len, "released block");
  }

  fn find_block(
    &self,
    ptr: NonNull<u8>,
  ) -> Option<usize> {
    self.blocks.as_slice().iter().position(|block| block.ptr == ptr)
  }

  pub fn owns(
    &self,
    ptr: NonNull<u8>,
  ) -> bool {
    self.find_block(ptr).is_some()
  }

  /// Frees every remaining block, then the record storage.
  pub fn deinit(
    &mut self,
    upstream: &mut dyn RawAlloc,
  ) {
    let count = self.blocks.len();
    let bytes = self.allocated();
    while let Some(block) = self.blocks.pop() {
      unsafe { upstream.free(block.ptr, block.len, block.align) };
    }
    self.blocks.clear_and_free(upstream);
    debug!(count, bytes, "block allocator released");
  }

  /// Total bytes of all tracked blocks.
  pub fn allocated(&self) -> usize {
    self.blocks.as_slice().iter().map(|block| block.len).sum()
  }

  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }
}

/// A [`BlockAllocator`] paired with its upstream, usable as a plain
/// [`RawAlloc`].
pub struct Blocks<'a> {
  pub blocks: &'a mut BlockAllocator,
  pub upstream: &'a mut dyn RawAlloc,
}

impl RawAlloc for Blocks<'_> {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    self.blocks.alloc(self.upstream, len, align)
  }

  unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    _len: usize,
    _align: usize,
  ) {
    unsafe { self.blocks.free(self.upstream, ptr) }
  }
}
