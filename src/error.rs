//! Error taxonomy for the allocator tree.
//!
//! Only recoverable conditions are represented here. Invariant violations
//! (freeing an untracked block, double free) panic at the point of
//! detection since continuing would corrupt the free lists.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// The upstream allocator (or the OS) refused the request.
  #[error("out of memory: requested {requested} bytes")]
  OutOfMemory { requested: usize },

  /// A fixed-capacity buddy free list had no room for a split half.
  #[error("free list for size class {class} is full")]
  FreeListFull { class: usize },

  /// The scratch buffer cannot fit the request.
  #[error("scratch buffer exhausted: requested {requested} bytes, available {available} bytes")]
  ScratchExhausted { requested: usize, available: usize },

  /// The node id does not refer to a live node of this tree.
  #[error("unknown or removed allocator node")]
  UnknownNode,

  /// Size/alignment pair that cannot form a layout.
  #[error("invalid allocation layout")]
  InvalidLayout,
}

impl AllocError {
  /// True for every flavour of memory exhaustion.
  pub fn is_out_of_memory(&self) -> bool {
    matches!(
      self,
      AllocError::OutOfMemory { .. } | AllocError::FreeListFull { .. } | AllocError::ScratchExhausted { .. }
    )
  }
}

pub type Result<T> = std::result::Result<T, AllocError>;
