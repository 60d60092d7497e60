//! OS page allocation: the root upstream of every allocator tree.

use std::ptr::{self, NonNull};

use libc::{_SC_PAGESIZE, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, sysconf};
use once_cell::sync::OnceCell;
use tracing::{trace, warn};

use crate::{
  align_to,
  error::{AllocError, Result},
  raw::{RawAlloc, check_layout},
};

const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: OnceCell<usize> = OnceCell::new();

/// The system page size, queried once.
pub fn page_size() -> usize {
  *PAGE_SIZE.get_or_init(|| {
    let ps = unsafe { sysconf(_SC_PAGESIZE) };
    if ps <= 0 || !(ps as usize).is_power_of_two() {
      warn!(ps, "sysconf(_SC_PAGESIZE) failed, assuming 4096");
      FALLBACK_PAGE_SIZE
    } else {
      ps as usize
    }
  })
}

/// Outstanding OS mappings owned by an [`OsPageAllocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
  pub mappings: usize,
  pub bytes: usize,
}

/// Hands out whole pages straight from `mmap`.
///
/// Every request is rounded up to a page multiple. Alignments up to the
/// page size come for free; anything larger is refused.
#[derive(Debug, Default)]
pub struct OsPageAllocator {
  stats: PageStats,
}

impl OsPageAllocator {
  pub const fn new() -> Self {
    Self {
      stats: PageStats {
        mappings: 0,
        bytes: 0,
      },
    }
  }

  pub fn stats(&self) -> PageStats {
    self.stats
  }
}

impl RawAlloc for OsPageAllocator {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    check_layout(len, align)?;
    let page = page_size();
    if align > page {
      return Err(AllocError::InvalidLayout);
    }
    let size = align_to!(len.max(1), page);

    let addr = unsafe {
      libc::mmap(
        ptr::null_mut(),
        size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if addr == MAP_FAILED {
      warn!(size, "mmap failed");
      return Err(AllocError::OutOfMemory { requested: len });
    }

    self.stats.mappings += 1;
    self.stats.bytes += size;
    trace!(?addr, size, "mapped pages");

    NonNull::new(addr as *mut u8).ok_or(AllocError::OutOfMemory { requested: len })
  }

  unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    _align: usize,
  ) {
    let size = align_to!(len.max(1), page_size());
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
    assert_eq!(rc, 0, "munmap of {ptr:?} ({size} bytes) failed");

    self.stats.mappings -= 1;
    self.stats.bytes -= size;
    trace!(?ptr, size, "unmapped pages");
  }
}
