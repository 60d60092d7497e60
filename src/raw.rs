use std::{mem, ptr, ptr::NonNull};

use crate::error::{AllocError, Result};

/// The allocation capability every layer of the tree speaks.
///
/// `free` must be handed the same `len` and `align` the block was
/// allocated with. Typed helpers are provided on top of the two raw
/// operations; they are only available on sized implementors, so reach
/// for them through a concrete allocator or a `&mut` handle.
pub trait RawAlloc {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>>;

  /// # Safety
  ///
  /// `ptr` must come from `alloc` on this allocator with the same `len`
  /// and `align`, and must not be used afterwards.
  unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  );

  fn create<T>(
    &mut self,
    value: T,
  ) -> Result<NonNull<T>>
  where
    Self: Sized,
  {
    let ptr = self.alloc(mem::size_of::<T>(), mem::align_of::<T>())?.cast::<T>();
    unsafe { ptr.as_ptr().write(value) };
    Ok(ptr)
  }

  /// # Safety
  ///
  /// `ptr` must come from `create` on this allocator.
  unsafe fn destroy<T>(
    &mut self,
    ptr: NonNull<T>,
  ) where
    Self: Sized,
  {
    unsafe {
      ptr::drop_in_place(ptr.as_ptr());
      self.free(ptr.cast(), mem::size_of::<T>(), mem::align_of::<T>());
    }
  }

  fn alloc_slice<T>(
    &mut self,
    count: usize,
  ) -> Result<NonNull<[T]>>
  where
    Self: Sized,
  {
    let len = mem::size_of::<T>()
      .checked_mul(count)
      .ok_or(AllocError::InvalidLayout)?;
    let ptr = self.alloc(len, mem::align_of::<T>())?;
    Ok(NonNull::slice_from_raw_parts(ptr.cast::<T>(), count))
  }

  /// # Safety
  ///
  /// `slice` must come from `alloc_slice` (or `dupe`) on this allocator.
  unsafe fn free_slice<T>(
    &mut self,
    slice: NonNull<[T]>,
  ) where
    Self: Sized,
  {
    unsafe {
      self.free(
        slice.cast::<u8>(),
        mem::size_of::<T>() * slice.len(),
        mem::align_of::<T>(),
      )
    };
  }

  fn dupe<T: Copy>(
    &mut self,
    src: &[T],
  ) -> Result<NonNull<[T]>>
  where
    Self: Sized,
  {
    let dst = self.alloc_slice::<T>(src.len())?;
    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.cast::<T>().as_ptr(), src.len()) };
    Ok(dst)
  }
}

impl<A: RawAlloc + ?Sized> RawAlloc for &mut A {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    (**self).alloc(len, align)
  }

  unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    unsafe { (**self).free(ptr, len, align) }
  }
}

/// `len` and `align` must describe a valid layout.
#[inline]
pub(crate) fn check_layout(
  len: usize,
  align: usize,
) -> Result<()> {
  if !align.is_power_of_two() || len > isize::MAX as usize - (align - 1) {
    return Err(AllocError::InvalidLayout);
  }
  Ok(())
}
