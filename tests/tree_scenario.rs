use std::ptr::NonNull;

use proptest::{
  prelude::RngExt,
  test_runner::{RngAlgorithm, TestRng},
};
use sphalloc::{RawAlloc, SphallocTree, TinyPageAllocator};

const SLOTS: usize = 100;
const ITERATIONS: usize = 5000;

fn fill(
  slice: NonNull<[u16]>,
  tag: u16,
) {
  unsafe { std::slice::from_raw_parts_mut(slice.cast::<u16>().as_ptr(), slice.len()).fill(tag) };
}

fn verify(
  slice: NonNull<[u16]>,
  tag: u16,
) {
  let values = unsafe { slice.as_ref() };
  assert!(values.iter().all(|&v| v == tag), "slot content clobbered");
}

/// Churns `child1`'s general-purpose allocator, then tears the whole tree
/// down. "Everything went back to the OS" is checked through the page
/// allocator's mapping counters rather than a `/proc/self/maps` diff:
/// other tests in this binary map and unmap concurrently, so a process-wide
/// snapshot is not stable. That `munmap` really releases the recorded
/// length is covered by the page allocator's own tests.
#[test]
fn test_round_robin_then_teardown() {
  sphalloc::logging::init();

  let mut tree = SphallocTree::new(TinyPageAllocator::new(), "root").unwrap();
  let root = tree.root();
  let child1 = tree.make_sub_alloc(root, "child1").unwrap();
  let child2 = tree.make_sub_alloc(root, "child2").unwrap();

  let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
  let mut slots: Vec<Option<(NonNull<[u16]>, u16)>> = vec![None; SLOTS];

  for i in 0..ITERATIONS {
    let mut gpa = tree.gpa(child1).unwrap();
    let slot = &mut slots[i % SLOTS];
    if let Some((old, tag)) = slot.take() {
      verify(old, tag);
      unsafe { gpa.free_slice(old) };
    }

    let len = rng.random_range(1..=1000);
    let tag = i as u16;
    let new = gpa.alloc_slice::<u16>(len).unwrap();
    fill(new, tag);
    *slot = Some((new, tag));
  }

  for (old, tag) in slots.iter_mut().filter_map(Option::take) {
    verify(old, tag);
    unsafe { tree.gpa(child1).unwrap().free_slice(old) };
  }

  assert_eq!(tree.own_memory_allocated(child2), Some(0));
  assert!(tree.total_memory_allocated(root) >= tree.total_memory_allocated(child1));

  tree.deinit(root).unwrap();
  assert!(tree.is_empty());
  assert!(tree.upstream().free_counts().iter().all(|&count| count == 0));
  assert_eq!(tree.upstream().fallback().stats().mappings, 0);
  assert_eq!(tree.upstream().fallback().stats().bytes, 0);
}

#[test]
fn test_sibling_reset_keeps_other_branch() {
  let mut tree = SphallocTree::new(TinyPageAllocator::new(), "root").unwrap();
  let root = tree.root();
  let left = tree.make_sub_alloc(root, "left").unwrap();
  let right = tree.make_sub_alloc(root, "right").unwrap();
  let leaf = tree.make_sub_alloc(left, "leaf").unwrap();

  let kept = tree.gpa(right).unwrap().dupe(&[7u64; 64]).unwrap();
  tree.arena(leaf).unwrap().alloc_slice::<u8>(10_000).unwrap();

  tree.reset(left).unwrap();
  assert!(!tree.contains(leaf));
  assert_eq!(tree.total_memory_allocated(left), Some(0));
  assert_eq!(unsafe { kept.as_ref() }, &[7u64; 64][..]);
  assert_eq!(tree.children(root), vec![right, left]);
}
