//! Allocator test doubles.

use std::ptr::NonNull;

use crate::{
  error::{AllocError, Result},
  page::OsPageAllocator,
  raw::RawAlloc,
};

/// Serves a fixed number of allocations from `inner`, then fails every
/// request with [`AllocError::OutOfMemory`]. Frees always go through.
#[derive(Debug, Default)]
pub struct FailingAllocator<A: RawAlloc = OsPageAllocator> {
  inner: A,
  remaining: usize,
  failures: usize,
}

impl FailingAllocator<OsPageAllocator> {
  /// Fails every allocation.
  pub fn always() -> Self {
    Self::after(0)
  }

  /// Succeeds `successes` times, then fails.
  pub fn after(successes: usize) -> Self {
    Self::wrap(OsPageAllocator::new(), successes)
  }
}

impl<A: RawAlloc> FailingAllocator<A> {
  pub fn wrap(
    inner: A,
    successes: usize,
  ) -> Self {
    Self {
      inner,
      remaining: successes,
      failures: 0,
    }
  }

  /// Number of allocations refused so far.
  pub fn failures(&self) -> usize {
    self.failures
  }

  pub fn set_remaining(
    &mut self,
    successes: usize,
  ) {
    self.remaining = successes;
  }

  pub fn inner(&self) -> &A {
    &self.inner
  }
}

impl<A: RawAlloc> RawAlloc for FailingAllocator<A> {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    if self.remaining == 0 {
      self.failures += 1;
      return Err(AllocError::OutOfMemory { requested: len });
    }
    self.remaining -= 1;
    self.inner.alloc(len, align)
  }

  unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    unsafe { self.inner.free(ptr, len, align) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fails_after_budget() {
    let mut alloc = FailingAllocator::after(1);

    let ptr = alloc.alloc(64, 8).unwrap();
    assert_eq!(
      alloc.alloc(64, 8),
      Err(AllocError::OutOfMemory { requested: 64 })
    );
    assert_eq!(alloc.failures(), 1);

    unsafe { alloc.free(ptr, 64, 8) };
    assert_eq!(alloc.inner().stats().mappings, 0);
  }
}
