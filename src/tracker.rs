//! Periodic memory usage sampling over an allocator tree.
//!
//! Each sampling pass appends one `(name, bytes)` record per node, walking
//! the tree depth-first, followed by an empty-name sentinel. The history
//! is a fixed-size ring; when the oldest records fall out, so do the
//! passes they belonged to.

use std::{
  collections::{HashMap, VecDeque},
  time::Instant,
};

use tracing::{trace, warn};

use crate::{
  config::TrackerConfig,
  node::{NodeId, SphallocTree},
  raw::RawAlloc,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySample {
  pub name: String,
  pub bytes: usize,
}

impl MemorySample {
  fn sentinel() -> Self {
    Self {
      name: String::new(),
      bytes: 0,
    }
  }

  pub fn is_sentinel(&self) -> bool {
    self.name.is_empty()
  }
}

/// Per-pass byte counts for one node name, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySeries {
  pub name: String,
  pub samples: Vec<usize>,
  pub max: usize,
}

pub struct MemoryTracker {
  root: NodeId,
  config: TrackerConfig,
  history: VecDeque<MemorySample>,
  passes: usize,
  last_sample: Option<Instant>,
}

impl MemoryTracker {
  pub fn new(
    root: NodeId,
    config: TrackerConfig,
  ) -> Self {
    let capacity = config.history_capacity.max(2);
    let mut history = VecDeque::with_capacity(capacity);
    history.push_back(MemorySample::sentinel());
    Self {
      root,
      config,
      history,
      passes: 0,
      last_sample: None,
    }
  }

  /// Complete passes currently held in the history.
  pub fn passes(&self) -> usize {
    self.passes
  }

  pub fn history(&self) -> impl Iterator<Item = &MemorySample> {
    self.history.iter()
  }

  /// Samples the tree if at least one sample period has passed since the
  /// previous pass. Returns whether a pass was taken.
  pub fn step<U: RawAlloc>(
    &mut self,
    tree: &SphallocTree<U>,
    now: Instant,
  ) -> bool {
    if let Some(last) = self.last_sample {
      if now.saturating_duration_since(last) < self.config.sample_period {
        return false;
      }
    }
    self.last_sample = Some(now);

    let mut truncated = false;
    let mut stack = vec![(self.root, 0usize)];
    while let Some((id, depth)) = stack.pop() {
      let (Some(name), Some(bytes)) = (tree.name(id), tree.own_memory_allocated(id)) else {
        continue;
      };
      self.push(MemorySample {
        name: name.to_owned(),
        bytes,
      });

      let children = tree.children(id);
      if depth + 1 >= self.config.max_depth {
        truncated |= !children.is_empty();
        continue;
      }
      stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
    }
    self.push(MemorySample::sentinel());
    self.passes += 1;

    if truncated {
      warn!(max_depth = self.config.max_depth, "memory tracker skipped nodes below max depth");
    }
    trace!(passes = self.passes, "memory tracker pass");
    true
  }

  fn push(
    &mut self,
    sample: MemorySample,
  ) {
    if self.history.len() >= self.config.history_capacity.max(2) {
      if let Some(evicted) = self.history.pop_front() {
        if evicted.is_sentinel() {
          self.passes = self.passes.saturating_sub(1);
        }
      }
    }
    self.history.push_back(sample);
  }

  /// Rebuilds one aligned series per node name from the history. Names
  /// that did not exist yet in a pass read as zero; identically named
  /// nodes are summed.
  pub fn collect(&self) -> Vec<MemorySeries> {
    let mut series: Vec<MemorySeries> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    let complete = self.history.iter().skip_while(|sample| !sample.is_sentinel()).skip(1);
    let mut pass = 0;
    for sample in complete {
      if sample.is_sentinel() {
        pass += 1;
        continue;
      }
      let slot = *index.entry(sample.name.as_str()).or_insert_with(|| {
        series.push(MemorySeries {
          name: sample.name.clone(),
          samples: Vec::new(),
          max: 0,
        });
        series.len() - 1
      });
      let entry = &mut series[slot];
      if entry.samples.len() <= pass {
        entry.samples.resize(pass + 1, 0);
      }
      entry.samples[pass] += sample.bytes;
    }

    for entry in &mut series {
      entry.samples.resize(pass, 0);
      entry.max = entry.samples.iter().copied().max().unwrap_or(0);
    }
    series.retain(|entry| !entry.samples.is_empty());
    series
  }
}
