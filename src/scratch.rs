//! Fixed-buffer scratch allocation with checkpoints.
//!
//! ```text
//!   buf ┌──────────┬────────────┬───────────┬──────────────┐
//!       │  kept    │ temp temp  │  wanted   │    free      │
//!       └──────────┴────────────┴───────────┴──────────────┘
//!                  ▲ checkpoint             ▲ end
//!
//!   restore_and_preserve(wanted, checkpoint):
//!       ┌──────────┬───────────┬───────────────────────────┐
//!       │  kept    │  wanted   │          free             │
//!       └──────────┴───────────┴───────────────────────────┘
//!                              ▲ returned checkpoint / end
//! ```

use std::{marker::PhantomData, mem, ptr, ptr::NonNull};

use tracing::trace;

use crate::{
  align::align_up,
  error::{AllocError, Result},
  raw::{RawAlloc, check_layout},
};

/// Byte written over reclaimed scratch memory in debug builds.
pub const SCRATCH_POISON: u8 = 0xAA;

/// A saved cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(usize);

pub struct ScratchAllocator<'buf> {
  base: NonNull<u8>,
  cap: usize,
  end: usize,
  _buf: PhantomData<&'buf mut [u8]>,
}

impl<'buf> ScratchAllocator<'buf> {
  pub fn new(buf: &'buf mut [u8]) -> Self {
    let cap = buf.len();
    let base = NonNull::new(buf.as_mut_ptr()).unwrap_or(NonNull::dangling());
    Self {
      base,
      cap,
      end: 0,
      _buf: PhantomData,
    }
  }

  /// # Safety
  ///
  /// `base` must be valid for reads and writes of `cap` bytes for as long
  /// as the allocator and anything allocated from it are in use.
  pub unsafe fn from_raw_parts(
    base: NonNull<u8>,
    cap: usize,
  ) -> Self {
    Self {
      base,
      cap,
      end: 0,
      _buf: PhantomData,
    }
  }

  #[inline]
  pub fn checkpoint(&self) -> Checkpoint {
    Checkpoint(self.end)
  }

  /// Rolls the cursor back, invalidating everything allocated since `cp`.
  pub fn restore(
    &mut self,
    cp: Checkpoint,
  ) {
    assert!(
      cp.0 <= self.end,
      "restoring checkpoint {} past the cursor {}",
      cp.0,
      self.end
    );
    self.poison(cp.0, self.end);
    self.end = cp.0;
  }

  pub fn used(&self) -> usize {
    self.end
  }

  pub fn available(&self) -> usize {
    self.cap - self.end
  }

  pub fn capacity(&self) -> usize {
    self.cap
  }

  /// Whether `ptr` points into the scratch buffer.
  pub fn owns(
    &self,
    ptr: *const u8,
  ) -> bool {
    let addr = ptr as usize;
    let base = self.base.as_ptr() as usize;
    addr >= base && addr < base + self.cap
  }

  /// The largest run of `T` that fits in what is left, capped at
  /// `max_count`. May be empty.
  pub fn alloc_greedy<T>(
    &mut self,
    max_count: usize,
  ) -> NonNull<[T]> {
    let Some(start) = self.aligned_offset(self.end, mem::align_of::<T>()) else {
      return NonNull::slice_from_raw_parts(NonNull::dangling(), 0);
    };
    let count = match mem::size_of::<T>() {
      0 => max_count,
      size => ((self.cap - start) / size).min(max_count),
    };
    self.end = start + count * mem::size_of::<T>();
    NonNull::slice_from_raw_parts(self.at(start).cast::<T>(), count)
  }

  /// Everything that is left, as a run of `T`.
  pub fn alloc_max<T>(&mut self) -> NonNull<[T]> {
    self.alloc_greedy(usize::MAX)
  }

  /// Rolls back to `base` while keeping `content`.
  ///
  /// If `content` lives in this buffer past `base`, it is moved down to
  /// the first suitably aligned offset after `base` and everything in
  /// between is reclaimed. Otherwise it is duplicated into `fallback` and
  /// the buffer is simply restored to `base`. Either way the returned
  /// checkpoint replaces `base` for later restores.
  ///
  /// # Safety
  ///
  /// `content` must be valid for reads.
  pub unsafe fn restore_and_preserve<T: Copy>(
    &mut self,
    fallback: &mut dyn RawAlloc,
    content: NonNull<[T]>,
    base: Checkpoint,
  ) -> Result<(NonNull<[T]>, Checkpoint)> {
    let count = content.len();
    let bytes = count * mem::size_of::<T>();
    let src = content.cast::<T>();

    if bytes == 0 {
      self.restore(base);
      return Ok((NonNull::slice_from_raw_parts(NonNull::dangling(), count), base));
    }

    let offset = (src.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
    if self.owns(src.as_ptr().cast()) && offset + bytes <= base.0 {
      // Already below the checkpoint; survives the restore as is.
      self.restore(base);
      return Ok((content, base));
    }
    let in_reclaimed_range = self.owns(src.as_ptr().cast()) && offset >= base.0 && offset + bytes <= self.end;

    if !in_reclaimed_range {
      let dst = fallback.alloc(bytes, mem::align_of::<T>())?.cast::<T>();
      unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), count) };
      self.restore(base);
      return Ok((NonNull::slice_from_raw_parts(dst, count), base));
    }

    let Some(start) = self.aligned_offset(base.0, mem::align_of::<T>()) else {
      unreachable!("content already fits after the checkpoint");
    };
    let dst = self.at(start).cast::<T>();
    unsafe { ptr::copy(src.as_ptr(), dst.as_ptr(), count) };

    let new_end = start + bytes;
    self.poison(new_end, self.end);
    self.end = new_end;
    trace!(from = offset, to = start, bytes, "scratch content compacted");

    Ok((NonNull::slice_from_raw_parts(dst, count), Checkpoint(new_end)))
  }

  fn aligned_offset(
    &self,
    offset: usize,
    align: usize,
  ) -> Option<usize> {
    let base = self.base.as_ptr() as usize;
    let start = align_up(base + offset, align)? - base;
    if start > self.cap { None } else { Some(start) }
  }

  #[inline]
  fn at(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    unsafe { self.base.add(offset) }
  }

  #[cfg(debug_assertions)]
  fn poison(
    &mut self,
    from: usize,
    to: usize,
  ) {
    if to > from {
      unsafe { self.at(from).as_ptr().write_bytes(SCRATCH_POISON, to - from) };
    }
  }

  #[cfg(not(debug_assertions))]
  #[inline]
  fn poison(
    &mut self,
    _from: usize,
    _to: usize,
  ) {
  }
}

impl RawAlloc for ScratchAllocator<'_> {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    check_layout(len, align)?;
    let exhausted = AllocError::ScratchExhausted {
      requested: len,
      available: self.available(),
    };
    let start = self.aligned_offset(self.end, align).ok_or(exhausted)?;
    let new_end = start.checked_add(len).filter(|&end| end <= self.cap).ok_or(exhausted)?;
    self.end = new_end;
    Ok(self.at(start))
  }

  /// Individual frees are ignored; use [`ScratchAllocator::restore`].
  unsafe fn free(
    &mut self,
    _ptr: NonNull<u8>,
    _len: usize,
    _align: usize,
  ) {
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{node::SphallocTree, page::OsPageAllocator, tiny_page::TinyPageAllocator};

  #[test]
  fn test_restore_fresh_checkpoint_is_noop() {
    let mut buf = [0u8; 256];
    let mut scratch = ScratchAllocator::new(&mut buf);
    scratch.alloc(10, 1).unwrap();

    let cp = scratch.checkpoint();
    scratch.restore(cp);
    assert_eq!(scratch.used(), 10);
    assert_eq!(scratch.checkpoint(), cp);
  }

  #[test]
  fn test_nested_checkpoints_compose() {
    let mut buf = [0u8; 256];
    let mut scratch = ScratchAllocator::new(&mut buf);

    let outer = scratch.checkpoint();
    scratch.alloc(32, 8).unwrap();
    let inner = scratch.checkpoint();
    scratch.alloc(64, 8).unwrap();

    scratch.restore(inner);
    assert_eq!(scratch.used(), 32);
    scratch.alloc(16, 8).unwrap();

    scratch.restore(outer);
    assert_eq!(scratch.used(), 0);
    assert_eq!(scratch.available(), 256);
  }

  #[test]
  #[cfg(debug_assertions)]
  fn test_restore_poisons_reclaimed_bytes() {
    let mut buf = [0u8; 64];
    {
      let mut scratch = ScratchAllocator::new(&mut buf);
      let cp = scratch.checkpoint();
      let ptr = scratch.alloc(16, 1).unwrap();
      unsafe { ptr.as_ptr().write_bytes(1, 16) };
      scratch.restore(cp);
    }
    assert!(buf[..16].iter().all(|&b| b == SCRATCH_POISON));
    assert!(buf[16..].iter().all(|&b| b == 0));
  }

  #[test]
  fn test_exhaustion() {
    let mut buf = [0u8; 32];
    let mut scratch = ScratchAllocator::new(&mut buf);
    scratch.alloc(30, 1).unwrap();

    assert_eq!(
      scratch.alloc(8, 1),
      Err(AllocError::ScratchExhausted {
        requested: 8,
        available: 2
      })
    );
    assert_eq!(scratch.used(), 30);
  }

  #[test]
  fn test_alloc_greedy_and_max() {
    let mut buf = [0u64; 16];
    let bytes = unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>(), 128) };
    let mut scratch = ScratchAllocator::new(bytes);

    scratch.alloc(3, 1).unwrap();
    let run = scratch.alloc_greedy::<u32>(10);
    assert_eq!(run.len(), 10);
    assert_eq!(run.cast::<u32>().as_ptr() as usize % 4, 0);
    assert_eq!(scratch.used(), 4 + 40);

    let rest = scratch.alloc_max::<u64>();
    assert_eq!(rest.len(), (128 - 48) / 8);
    assert_eq!(scratch.available(), 0);

    assert_eq!(scratch.alloc_max::<u8>().len(), 0);
  }

  #[test]
  fn test_preserve_compacts_to_checkpoint() {
    let mut buf = [0u64; 32];
    let bytes = unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>(), 256) };
    let mut scratch = ScratchAllocator::new(bytes);
    let mut pages = OsPageAllocator::new();

    scratch.alloc(5, 1).unwrap();
    let cp = scratch.checkpoint();
    scratch.alloc(40, 1).unwrap();
    let wanted = scratch.dupe(&[10u32, 20, 30]).unwrap();
    scratch.alloc(17, 1).unwrap();

    let (kept, new_cp) = unsafe { scratch.restore_and_preserve(&mut pages, wanted, cp).unwrap() };

    let offset = kept.cast::<u8>().as_ptr() as usize - scratch.base.as_ptr() as usize;
    assert_eq!(offset, 8);
    assert_eq!(unsafe { kept.as_ref() }, &[10, 20, 30]);
    assert_eq!(new_cp, Checkpoint(20));
    assert_eq!(scratch.used(), 20);
    assert_eq!(pages.stats().mappings, 0);

    scratch.restore(new_cp);
    assert_eq!(unsafe { kept.as_ref() }, &[10, 20, 30]);
  }

  #[test]
  fn test_preserve_foreign_content_duplicates() {
    let mut buf = [0u8; 128];
    let mut scratch = ScratchAllocator::new(&mut buf);
    let mut tree = SphallocTree::new(TinyPageAllocator::new(), "root").unwrap();
    let root = tree.root();

    let cp = scratch.checkpoint();
    scratch.alloc(64, 1).unwrap();
    let foreign = [7u16; 9];
    let content = NonNull::from(&foreign[..]);

    let mut gpa = tree.gpa(root).unwrap();
    let (copy, returned) = unsafe { scratch.restore_and_preserve(&mut gpa, content, cp).unwrap() };
    assert_eq!(returned, cp);
    assert_eq!(scratch.used(), 0);
    assert_eq!(unsafe { copy.as_ref() }, &foreign[..]);
    assert!(!scratch.owns(copy.cast::<u8>().as_ptr()));

    unsafe { gpa.free_slice(copy) };
  }

  #[test]
  fn test_preserve_content_below_checkpoint_stays() {
    let mut buf = [0u8; 64];
    let mut scratch = ScratchAllocator::new(&mut buf);
    let mut pages = OsPageAllocator::new();

    let kept = scratch.dupe(&[4u8, 5, 6]).unwrap();
    let cp = scratch.checkpoint();
    scratch.alloc(20, 1).unwrap();

    let (same, returned) = unsafe { scratch.restore_and_preserve(&mut pages, kept, cp).unwrap() };
    assert_eq!(same, kept);
    assert_eq!(returned, cp);
    assert_eq!(scratch.used(), 3);
    assert_eq!(pages.stats().mappings, 0);
  }

  #[test]
  fn test_backed_by_node_arena() {
    let mut tree = SphallocTree::new(TinyPageAllocator::new(), "root").unwrap();
    let root = tree.root();
    let region = tree.arena(root).unwrap().alloc(512, 16).unwrap();

    let mut scratch = unsafe { ScratchAllocator::from_raw_parts(region, 512) };
    let values = scratch.dupe(&[1u8, 2, 3]).unwrap();
    assert!(scratch.owns(values.cast::<u8>().as_ptr()));
    assert_eq!(scratch.capacity(), 512);
  }
}
