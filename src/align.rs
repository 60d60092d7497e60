/// Rounds `value` up to the next multiple of `align`.
///
/// `align` must be a power of two.
///
/// # Examples
///
/// ```rust
/// use sphalloc::align_to;
///
/// assert_eq!(align_to!(13, 8), 16);
/// assert_eq!(align_to!(256, 256), 256);
/// assert_eq!(align_to!(0, 64), 0);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $align:expr) => {
    ($value + $align - 1) & !($align - 1)
  };
}

/// Overflow-checked form of [`align_to!`] for addresses.
#[inline]
pub const fn align_up(
  addr: usize,
  align: usize,
) -> Option<usize> {
  match addr.checked_add(align - 1) {
    Some(v) => Some(v & !(align - 1)),
    None => None,
  }
}

#[inline]
pub const fn is_aligned(
  addr: usize,
  align: usize,
) -> bool {
  addr & (align - 1) == 0
}

/// `ceil(log2(len))`, with `log2_ceil(0) == log2_ceil(1) == 0`.
#[inline]
pub const fn log2_ceil(len: usize) -> u32 {
  if len <= 1 {
    0
  } else {
    usize::BITS - (len - 1).leading_zeros()
  }
}

/// Rounds a block request the way upstream blocks are handed out: the next
/// power of two below `page`, whole pages at or above it.
#[inline]
pub const fn round_block_len(
  len: usize,
  page: usize,
) -> usize {
  if len < page {
    len.next_power_of_two()
  } else {
    align_to!(len, page)
  }
}
