//! A growable list whose storage is drawn from a caller-supplied allocator.
//!
//! The list does not remember its allocator; every operation that may
//! touch storage takes it as an argument, and the caller is responsible
//! for always passing the same one.

use std::{mem, ptr, ptr::NonNull, slice};

use crate::{error::Result, raw::RawAlloc};

pub struct PageList<T: Copy> {
  ptr: NonNull<T>,
  len: usize,
  cap: usize,
}

impl<T: Copy> PageList<T> {
  pub const fn new() -> Self {
    Self {
      ptr: NonNull::dangling(),
      len: 0,
      cap: 0,
    }
  }

  /// Capacity holding roughly `bytes` bytes worth of elements.
  pub const fn capacity_for(bytes: usize) -> usize {
    let per = mem::size_of::<T>();
    if per == 0 || bytes < per { 1 } else { bytes / per }
  }

  pub fn with_capacity(
    alloc: &mut dyn RawAlloc,
    cap: usize,
  ) -> Result<Self> {
    let mut list = Self::new();
    list.grow_to(alloc, cap)?;
    Ok(list)
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.cap
  }

  #[inline]
  pub fn is_full(&self) -> bool {
    self.len == self.cap
  }

  #[inline]
  pub fn as_slice(&self) -> &[T] {
    unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }

  /// Ensures room for one more element, allocating `initial` slots on first
  /// use and doubling afterwards.
  pub fn reserve_one(
    &mut self,
    alloc: &mut dyn RawAlloc,
    initial: usize,
  ) -> Result<()> {
    if self.len < self.cap {
      return Ok(());
    }
    let new_cap = if self.cap == 0 { initial.max(1) } else { self.cap * 2 };
    self.grow_to(alloc, new_cap)
  }

  pub fn push(
    &mut self,
    alloc: &mut dyn RawAlloc,
    initial: usize,
    value: T,
  ) -> Result<()> {
    self.reserve_one(alloc, initial)?;
    unsafe { self.ptr.as_ptr().add(self.len).write(value) };
    self.len += 1;
    Ok(())
  }

  pub fn pop(&mut self) -> Option<T> {
    if self.len == 0 {
      return None;
    }
    self.len -= 1;
    Some(unsafe { self.ptr.as_ptr().add(self.len).read() })
  }

  pub fn swap_remove(
    &mut self,
    idx: usize,
  ) -> T {
    assert!(idx < self.len, "swap_remove index {idx} out of bounds ({})", self.len);
    let base = self.ptr.as_ptr();
    unsafe {
      let value = base.add(idx).read();
      self.len -= 1;
      if idx != self.len {
        base.add(idx).write(base.add(self.len).read());
      }
      value
    }
  }

  /// Drops every element and returns the storage to `alloc`.
  pub fn clear_and_free(
    &mut self,
    alloc: &mut dyn RawAlloc,
  ) {
    if self.cap != 0 {
      unsafe { alloc.free(self.ptr.cast(), self.cap * mem::size_of::<T>(), mem::align_of::<T>()) };
    }
    *self = Self::new();
  }

  fn grow_to(
    &mut self,
    alloc: &mut dyn RawAlloc,
    new_cap: usize,
  ) -> Result<()> {
    if new_cap <= self.cap {
      return Ok(());
    }
    let new_ptr = alloc
      .alloc(new_cap * mem::size_of::<T>(), mem::align_of::<T>())?
      .cast::<T>();
    if self.cap != 0 {
      unsafe {
        ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
        alloc.free(self.ptr.cast(), self.cap * mem::size_of::<T>(), mem::align_of::<T>());
      }
    }
    self.ptr = new_ptr;
    self.cap = new_cap;
    Ok(())
  }
}

impl<T: Copy> Default for PageList<T> {
  fn default() -> Self {
    Self::new()
  }
}
