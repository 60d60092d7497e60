//! The scoped allocator tree.
//!
//! ```text
//!   SphallocTree ── upstream (TinyPageAllocator -> OS pages)
//!     │
//!     └── root ── block / gpa / bump
//!           ├── "child2" ── block / gpa / bump
//!           └── "child1" ── block / gpa / bump
//!                 └── ...
//! ```
//!
//! Every node owns a [`BlockAllocator`] drawing from the tree's upstream,
//! plus a [`GeneralPurposeAllocator`] and a [`BumpAllocator`] layered on
//! that block allocator. Nodes live in a slab addressed by [`NodeId`];
//! a node's child list is a singly-linked list whose links are allocated
//! from the node's own general-purpose allocator, so creating a child is
//! charged to its parent.

use std::{mem, ptr::NonNull};

use tracing::{debug, warn};

use crate::{
  block::{BlockAllocator, Blocks},
  bump::BumpAllocator,
  error::{AllocError, Result},
  general::GeneralPurposeAllocator,
  raw::RawAlloc,
  tiny_page::TinyPageAllocator,
};

/// Handle to a node of a [`SphallocTree`].
///
/// Ids are generational: once a node is removed its id never resolves
/// again, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
  index: u32,
  generation: u32,
}

#[repr(C)]
struct ChildLink {
  child: NodeId,
  next: Option<NonNull<ChildLink>>,
}

struct Node {
  name: String,
  parent: Option<NodeId>,
  children: Option<NonNull<ChildLink>>,
  block: BlockAllocator,
  gpa: GeneralPurposeAllocator,
  bump: BumpAllocator,
}

impl Node {
  fn new(
    name: &str,
    parent: Option<NodeId>,
    block: BlockAllocator,
  ) -> Self {
    Self {
      name: name.to_owned(),
      parent,
      children: None,
      block,
      gpa: GeneralPurposeAllocator::new(),
      bump: BumpAllocator::new(),
    }
  }

  fn gpa_alloc(
    &mut self,
    upstream: &mut dyn RawAlloc,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    let mut pages = Blocks {
      blocks: &mut self.block,
      upstream,
    };
    self.gpa.alloc(&mut pages, len, align)
  }

  unsafe fn gpa_free(
    &mut self,
    upstream: &mut dyn RawAlloc,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    let mut pages = Blocks {
      blocks: &mut self.block,
      upstream,
    };
    unsafe { self.gpa.free(&mut pages, ptr, len, align) }
  }

  fn bump_alloc(
    &mut self,
    upstream: &mut dyn RawAlloc,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    let mut blocks = Blocks {
      blocks: &mut self.block,
      upstream,
    };
    self.bump.alloc(&mut blocks, len, align)
  }

  /// Releases every block and forgets the allocators layered on them.
  fn release(
    &mut self,
    upstream: &mut dyn RawAlloc,
  ) {
    self.block.deinit(upstream);
    self.gpa = GeneralPurposeAllocator::new();
    self.bump = BumpAllocator::new();
    self.children = None;
  }
}

struct Slot {
  generation: u32,
  node: Option<Node>,
}

/// A tree of scoped allocators sharing one upstream allocator.
pub struct SphallocTree<U: RawAlloc = TinyPageAllocator> {
  upstream: U,
  slots: Vec<Slot>,
  vacant: Vec<u32>,
  root: NodeId,
}

impl<U: RawAlloc> SphallocTree<U> {
  /// Creates the tree with a single root node called `name`.
  pub fn new(
    mut upstream: U,
    name: &str,
  ) -> Result<Self> {
    let block = BlockAllocator::new(&mut upstream)?;
    let mut tree = Self {
      upstream,
      slots: Vec::new(),
      vacant: Vec::new(),
      root: NodeId {
        index: 0,
        generation: 0,
      },
    };
    tree.root = tree.insert(Node::new(name, None, block));
    debug!(name, "allocator tree created");
    Ok(tree)
  }

  pub fn root(&self) -> NodeId {
    self.root
  }

  pub fn contains(
    &self,
    id: NodeId,
  ) -> bool {
    self.node(id).is_some()
  }

  pub fn name(
    &self,
    id: NodeId,
  ) -> Option<&str> {
    self.node(id).map(|node| node.name.as_str())
  }

  pub fn parent(
    &self,
    id: NodeId,
  ) -> Option<NodeId> {
    self.node(id)?.parent
  }

  /// Direct children, most recently created first.
  pub fn children(
    &self,
    id: NodeId,
  ) -> Vec<NodeId> {
    let mut out = Vec::new();
    let Some(node) = self.node(id) else {
      return out;
    };
    let mut cursor = node.children;
    while let Some(link) = cursor {
      let link = unsafe { link.as_ref() };
      out.push(link.child);
      cursor = link.next;
    }
    out
  }

  /// Live nodes, including the root.
  pub fn len(&self) -> usize {
    self.slots.iter().filter(|slot| slot.node.is_some()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Bytes held by this node's own block allocator.
  pub fn own_memory_allocated(
    &self,
    id: NodeId,
  ) -> Option<usize> {
    self.node(id).map(|node| node.block.allocated())
  }

  /// Bytes held by this node and all of its descendants.
  pub fn total_memory_allocated(
    &self,
    id: NodeId,
  ) -> Option<usize> {
    let own = self.own_memory_allocated(id)?;
    let children: usize = self
      .children(id)
      .into_iter()
      .filter_map(|child| self.total_memory_allocated(child))
      .sum();
    Some(own + children)
  }

  /// Creates a child of `parent`.
  ///
  /// The child's list link comes out of the parent's general-purpose
  /// allocator. On failure nothing is left behind.
  pub fn make_sub_alloc(
    &mut self,
    parent: NodeId,
    name: &str,
  ) -> Result<NodeId> {
    let link = {
      let (node, upstream) = self.split(parent).ok_or(AllocError::UnknownNode)?;
      node.gpa_alloc(upstream, mem::size_of::<ChildLink>(), mem::align_of::<ChildLink>())?
    };

    let block = match BlockAllocator::new(&mut self.upstream) {
      Ok(block) => block,
      Err(err) => {
        warn!(name, %err, "sub-allocator creation failed");
        if let Some((node, upstream)) = self.split(parent) {
          unsafe { node.gpa_free(upstream, link, mem::size_of::<ChildLink>(), mem::align_of::<ChildLink>()) };
        }
        return Err(err);
      }
    };

    let child = self.insert(Node::new(name, Some(parent), block));

    let Some((node, _)) = self.split(parent) else {
      unreachable!("parent vanished while creating a child");
    };
    let link = link.cast::<ChildLink>();
    unsafe {
      link.as_ptr().write(ChildLink {
        child,
        next: node.children,
      })
    };
    node.children = Some(link);

    debug!(parent = %node.name, name, "sub-allocator created");
    Ok(child)
  }

  /// Frees everything owned by `id` and its descendants. The descendants
  /// are removed; `id` stays alive with fresh allocators.
  pub fn reset(
    &mut self,
    id: NodeId,
  ) -> Result<()> {
    if !self.contains(id) {
      return Err(AllocError::UnknownNode);
    }
    self.release_subtree(id);

    let Self { upstream, slots, .. } = self;
    let Some(node) = Self::slot_node(slots, id) else {
      unreachable!("node vanished during reset");
    };
    node.block = BlockAllocator::new(upstream)?;
    debug!(name = %node.name, "sub-allocator reset");
    Ok(())
  }

  /// Frees everything owned by `id` and its descendants, removes them all,
  /// and unlinks `id` from its parent.
  pub fn deinit(
    &mut self,
    id: NodeId,
  ) -> Result<()> {
    let parent = self.node(id).ok_or(AllocError::UnknownNode)?.parent;

    self.release_subtree(id);
    if let Some(node) = self.remove(id) {
      debug!(name = %node.name, "sub-allocator removed");
    }

    if let Some(parent) = parent {
      self.unlink(parent, id);
    }
    Ok(())
  }

  /// General-purpose allocation interface of `id`.
  pub fn gpa(
    &mut self,
    id: NodeId,
  ) -> Option<NodeGpa<'_>> {
    let (node, upstream) = self.split(id)?;
    Some(NodeGpa { node, upstream })
  }

  /// Bump allocation interface of `id`.
  pub fn arena(
    &mut self,
    id: NodeId,
  ) -> Option<NodeArena<'_>> {
    let (node, upstream) = self.split(id)?;
    Some(NodeArena { node, upstream })
  }

  pub fn upstream(&self) -> &U {
    &self.upstream
  }

  pub fn upstream_mut(&mut self) -> &mut U {
    &mut self.upstream
  }

  fn release_subtree(
    &mut self,
    id: NodeId,
  ) {
    for child in self.children(id) {
      self.release_subtree(child);
      self.remove(child);
    }
    if let Some((node, upstream)) = self.split(id) {
      node.release(upstream);
    }
  }

  fn unlink(
    &mut self,
    parent: NodeId,
    child: NodeId,
  ) {
    let Some((node, upstream)) = self.split(parent) else {
      return;
    };

    let mut prev: Option<NonNull<ChildLink>> = None;
    let mut cursor = node.children;
    while let Some(link) = cursor {
      let (link_child, next) = unsafe { (link.as_ref().child, link.as_ref().next) };
      if link_child == child {
        match prev {
          Some(mut prev) => unsafe { prev.as_mut().next = next },
          None => node.children = next,
        }
        unsafe {
          node.gpa_free(
            upstream,
            link.cast(),
            mem::size_of::<ChildLink>(),
            mem::align_of::<ChildLink>(),
          )
        };
        return;
      }
      prev = cursor;
      cursor = next;
    }
    panic!("{child:?} is not linked under {parent:?}");
  }

  fn insert(
    &mut self,
    node: Node,
  ) -> NodeId {
    if let Some(index) = self.vacant.pop() {
      let slot = &mut self.slots[index as usize];
      slot.node = Some(node);
      return NodeId {
        index,
        generation: slot.generation,
      };
    }
    let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| panic!("allocator tree node count overflow"));
    self.slots.push(Slot {
      generation: 0,
      node: Some(node),
    });
    NodeId {
      index,
      generation: 0,
    }
  }

  fn remove(
    &mut self,
    id: NodeId,
  ) -> Option<Node> {
    let slot = self.slots.get_mut(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    let node = slot.node.take()?;
    slot.generation = slot.generation.wrapping_add(1);
    self.vacant.push(id.index);
    Some(node)
  }

  fn node(
    &self,
    id: NodeId,
  ) -> Option<&Node> {
    let slot = self.slots.get(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    slot.node.as_ref()
  }

  fn slot_node(
    slots: &mut [Slot],
    id: NodeId,
  ) -> Option<&mut Node> {
    let slot = slots.get_mut(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    slot.node.as_mut()
  }

  fn split(
    &mut self,
    id: NodeId,
  ) -> Option<(&mut Node, &mut dyn RawAlloc)> {
    let Self { upstream, slots, .. } = self;
    let node = Self::slot_node(slots, id)?;
    Some((node, upstream as &mut dyn RawAlloc))
  }
}

impl<U: RawAlloc> Drop for SphallocTree<U> {
  fn drop(&mut self) {
    if self.contains(self.root) {
      let _ = self.deinit(self.root);
    }
  }
}

/// General-purpose allocation through one node.
pub struct NodeGpa<'a> {
  node: &'a mut Node,
  upstream: &'a mut dyn RawAlloc,
}

impl NodeGpa<'_> {
  pub fn name(&self) -> &str {
    &self.node.name
  }

  pub fn allocated(&self) -> usize {
    self.node.block.allocated()
  }
}

impl RawAlloc for NodeGpa<'_> {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    self.node.gpa_alloc(self.upstream, len, align)
  }

  unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
  ) {
    unsafe { self.node.gpa_free(self.upstream, ptr, len, align) }
  }
}

/// Bump allocation through one node. Frees are ignored.
pub struct NodeArena<'a> {
  node: &'a mut Node,
  upstream: &'a mut dyn RawAlloc,
}

impl NodeArena<'_> {
  pub fn name(&self) -> &str {
    &self.node.name
  }

  pub fn remaining(&self) -> usize {
    self.node.bump.remaining()
  }
}

impl RawAlloc for NodeArena<'_> {
  fn alloc(
    &mut self,
    len: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    self.node.bump_alloc(self.upstream, len, align)
  }

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
  use crate::{page::OsPageAllocator, testing::FailingAllocator};

  fn tree() -> SphallocTree {
    SphallocTree::new(TinyPageAllocator::new(), "root").unwrap()
  }

  fn assert_accounting(
    tree: &SphallocTree<impl RawAlloc>,
    id: NodeId,
  ) {
    let children: usize = tree
      .children(id)
      .into_iter()
      .map(|child| {
        assert_accounting(tree, child);
        tree.total_memory_allocated(child).unwrap()
      })
      .sum();
    assert_eq!(
      tree.total_memory_allocated(id).unwrap(),
      tree.own_memory_allocated(id).unwrap() + children
    );
  }

  #[test]
  fn test_children_are_prepended_and_charged_to_parent() {
    let mut tree = tree();
    let root = tree.root();
    let before = tree.own_memory_allocated(root).unwrap();

    let child1 = tree.make_sub_alloc(root, "child1").unwrap();
    let child2 = tree.make_sub_alloc(root, "child2").unwrap();

    assert_eq!(tree.children(root), vec![child2, child1]);
    assert_eq!(tree.parent(child1), Some(root));
    assert_eq!(tree.name(child2), Some("child2"));
    assert!(tree.own_memory_allocated(root).unwrap() > before);
    assert_eq!(tree.len(), 3);
    assert_accounting(&tree, root);
  }

  #[test]
  fn test_gpa_and_arena_through_nodes() {
    let mut tree = tree();
    let root = tree.root();
    let child = tree.make_sub_alloc(root, "child").unwrap();

    let mut gpa = tree.gpa(child).unwrap();
    let values = gpa.dupe(&[1u32, 2, 3, 4]).unwrap();
    let boxed = gpa.create(0xABCD_u64).unwrap();
    unsafe {
      assert_eq!(values.as_ref(), &[1, 2, 3, 4]);
      assert_eq!(*boxed.as_ptr(), 0xABCD);
      gpa.destroy(boxed);
      gpa.free_slice(values);
    }

    let mut arena = tree.arena(child).unwrap();
    let scratch = arena.alloc_slice::<u16>(100).unwrap();
    unsafe { arena.free_slice(scratch) };
    assert!(tree.own_memory_allocated(child).unwrap() > 0);

    assert_accounting(&tree, root);
  }

  #[test]
  fn test_over_aligned_values_through_gpa() {
    #[derive(Clone, Copy, Debug, PartialEq)]
    #[repr(align(16))]
    struct Wide(u32);

    #[repr(align(32))]
    struct Marker;

    let mut tree = tree();
    let root = tree.root();
    let mut gpa = tree.gpa(root).unwrap();

    let empty = gpa.dupe::<Wide>(&[]).unwrap();
    assert_eq!(empty.len(), 0);
    assert_eq!(empty.cast::<Wide>().as_ptr() as usize % 16, 0);
    let none = gpa.alloc_slice::<Wide>(0).unwrap();
    let marker = gpa.create(Marker).unwrap();
    assert_eq!(marker.as_ptr() as usize % 32, 0);
    let pair = gpa.dupe(&[Wide(1), Wide(2)]).unwrap();
    assert_eq!(unsafe { pair.as_ref() }, &[Wide(1), Wide(2)]);

    unsafe {
      gpa.free_slice(pair);
      gpa.destroy(marker);
      gpa.free_slice(none);
      gpa.free_slice(empty);
    }
    assert_eq!(tree.own_memory_allocated(root), Some(0));
  }

  #[test]
  fn test_reset_keeps_node_and_drops_descendants() {
    let mut tree = tree();
    let root = tree.root();
    let child = tree.make_sub_alloc(root, "child").unwrap();
    let grandchild = tree.make_sub_alloc(child, "grandchild").unwrap();

    tree.gpa(grandchild).unwrap().alloc(5000, 8).unwrap();
    tree.arena(child).unwrap().alloc(64, 8).unwrap();
    assert!(tree.total_memory_allocated(child).unwrap() > 5000);

    tree.reset(child).unwrap();
    assert!(tree.contains(child));
    assert!(!tree.contains(grandchild));
    assert!(tree.children(child).is_empty());
    assert_eq!(tree.total_memory_allocated(child), Some(0));
    assert_eq!(tree.children(root), vec![child]);

    // Still usable afterwards.
    tree.gpa(child).unwrap().alloc(32, 8).unwrap();
    assert_accounting(&tree, root);
  }

  #[test]
  fn test_deinit_unlinks_from_parent() {
    let mut tree = tree();
    let root = tree.root();
    let a = tree.make_sub_alloc(root, "a").unwrap();
    let b = tree.make_sub_alloc(root, "b").unwrap();
    let c = tree.make_sub_alloc(root, "c").unwrap();
    let root_with_three = tree.own_memory_allocated(root).unwrap();

    tree.deinit(b).unwrap();
    assert_eq!(tree.children(root), vec![c, a]);
    assert!(!tree.contains(b));
    assert_eq!(tree.deinit(b), Err(AllocError::UnknownNode));
    assert!(tree.own_memory_allocated(root).unwrap() <= root_with_three);

    tree.deinit(c).unwrap();
    tree.deinit(a).unwrap();
    assert!(tree.children(root).is_empty());
    assert_eq!(tree.own_memory_allocated(root), Some(0));
  }

  #[test]
  fn test_stale_ids_do_not_resolve_after_slot_reuse() {
    let mut tree = tree();
    let root = tree.root();
    let old = tree.make_sub_alloc(root, "old").unwrap();
    tree.deinit(old).unwrap();

    let new = tree.make_sub_alloc(root, "new").unwrap();
    assert_ne!(old, new);
    assert!(tree.gpa(old).is_none());
    assert_eq!(tree.name(new), Some("new"));
    assert_eq!(tree.make_sub_alloc(old, "x"), Err(AllocError::UnknownNode));
  }

  #[test]
  fn test_whole_tree_teardown_returns_all_pages() {
    let mut tree = tree();
    let root = tree.root();
    let child = tree.make_sub_alloc(root, "child").unwrap();
    for i in 0..20 {
      let sub = tree.make_sub_alloc(child, "sub").unwrap();
      tree.gpa(sub).unwrap().alloc(i * 37 + 1, 1).unwrap();
      tree.arena(sub).unwrap().alloc(i * 300 + 1, 8).unwrap();
    }

    tree.deinit(root).unwrap();
    assert!(tree.is_empty());
    assert_eq!(tree.upstream().fallback().stats().mappings, 0);
  }

  #[test]
  fn test_failed_creation_leaves_parent_untouched() {
    let upstream = FailingAllocator::wrap(OsPageAllocator::new(), usize::MAX);
    let mut tree = SphallocTree::new(upstream, "root").unwrap();
    let root = tree.root();

    for budget in 0..16 {
      tree.upstream_mut().set_remaining(budget);
      match tree.make_sub_alloc(root, "child") {
        Ok(child) => {
          tree.upstream_mut().set_remaining(usize::MAX);
          tree.deinit(child).unwrap();
        }
        Err(err) => assert!(err.is_out_of_memory()),
      }
      assert!(tree.children(root).is_empty());
      assert_eq!(tree.own_memory_allocated(root), Some(0));
    }
    assert!(tree.upstream().failures() > 0);
  }
}
