//! # sphalloc - Scoped Hierarchical Allocators
//!
//! This crate provides a **tree of scoped memory arenas**. Every node of the
//! tree owns a general-purpose buddy allocator and a bump allocator, both
//! fed by a block allocator that remembers every block it handed out, so a
//! whole subtree can be released in one pass.
//!
//! ## Overview
//!
//! ```text
//!   Allocation layers:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │  application code                                                    │
//!   │     │ gpa(id).alloc / free            │ arena(id).alloc              │
//!   │     ▼                                 ▼                              │
//!   │  GeneralPurposeAllocator (8B..256B)  BumpAllocator                   │
//!   │     │ buddy split / coalesce          │ new block when exhausted     │
//!   │     └───────────────┬─────────────────┘                              │
//!   │                     ▼                                                │
//!   │              BlockAllocator  (records every (ptr, len))              │
//!   │                     │                                                │
//!   │                     ▼                                                │
//!   │   shared upstream: TinyPageAllocator (256B..page) ──▶ OS pages       │
//!   └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   sphalloc
//!   ├── align      - Alignment helpers (align_to!, log2_ceil, ...)
//!   ├── raw        - RawAlloc, the allocation capability
//!   ├── page       - OS page allocator (mmap / munmap)
//!   ├── list       - PageList, growable list in allocator-provided memory
//!   ├── buddy      - Generic buddy split / coalesce over FreeListContext
//!   ├── tiny_page  - TinyPageAllocator, fixed-capacity free lists
//!   ├── general    - GeneralPurposeAllocator, growable free lists
//!   ├── block      - BlockAllocator
//!   ├── bump       - BumpAllocator
//!   ├── node       - SphallocTree, NodeId
//!   ├── scratch    - ScratchAllocator with checkpoints
//!   ├── tracker    - MemoryTracker
//!   ├── config     - TrackerConfig, LogConfig
//!   └── logging    - tracing subscriber setup
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use sphalloc::{RawAlloc, SphallocTree, TinyPageAllocator};
//!
//! let mut tree = SphallocTree::new(TinyPageAllocator::new(), "app").unwrap();
//! let root = tree.root();
//! let frame = tree.make_sub_alloc(root, "frame").unwrap();
//!
//! let mut gpa = tree.gpa(frame).unwrap();
//! let values = gpa.dupe(&[1u32, 2, 3]).unwrap();
//! unsafe { gpa.free_slice(values) };
//!
//! let mut arena = tree.arena(frame).unwrap();
//! let _scratch = arena.alloc_slice::<u8>(4096).unwrap();
//!
//! // Everything `frame` owns goes away at once.
//! tree.reset(frame).unwrap();
//! assert_eq!(tree.total_memory_allocated(frame), Some(0));
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: a tree and its allocators are `!Send`
//! - **No compaction**: live allocations never move
//! - **Unix-only**: the root page source uses `mmap(2)`
//!
//! ## Safety
//!
//! Frees take raw pointers and trust the caller to hand back what was
//! allocated. Freeing a pointer unknown to a block allocator, or freeing a
//! buddy block twice, panics.

pub mod align;
mod block;
pub mod buddy;
mod bump;
pub mod config;
mod error;
mod general;
mod list;
pub mod logging;
mod node;
mod page;
mod raw;
mod scratch;
pub mod testing;
mod tiny_page;
mod tracker;

pub use block::{Block, BlockAllocator, Blocks};
pub use buddy::FreeListContext;
pub use bump::BumpAllocator;
pub use error::{AllocError, Result};
pub use general::{GPA_CLASSES, GeneralPurposeAllocator};
pub use list::PageList;
pub use node::{NodeArena, NodeGpa, NodeId, SphallocTree};
pub use page::{OsPageAllocator, PageStats, page_size};
pub use raw::RawAlloc;
pub use scratch::{Checkpoint, SCRATCH_POISON, ScratchAllocator};
pub use tiny_page::{DEFAULT_TINY_CAPACITY, MAX_TINY_CLASSES, TinyPageAllocator};
pub use tracker::{MemorySample, MemorySeries, MemoryTracker};

/// Smallest unit of coarse allocation handed out by the tiny page allocator.
pub const TINY_PAGE_SIZE: usize = 1 << TINY_PAGE_LOG2;
pub const TINY_PAGE_LOG2: u32 = 8;

/// Smallest general-purpose block.
pub const GPA_MIN_LOG2: u32 = 3;
