//! Incremental interest-level propagation.
//!
//! Each node carries an optional source level (from tickets) and a propagated
//! level equal to `min(source, 1 + min(neighbour levels))`, capped at the
//! unloaded level. Sources are changed freely and settled in one batch by
//! [`LevelPropagator::propagate_updates`], which returns only the nodes whose
//! level changed.
//!
//! Decreases relax outward in level order (Dijkstra with unit weights).
//! Increases first clear every node that may have depended on the raised
//! node, then let the untouched border refill the cleared region.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::hash::Hash;

use crate::coords::{SectionPos, TilePos};

/// Neighbour relation the propagator relaxes over.
pub trait PropagationGraph {
  type Node: Copy + Eq + Hash + Debug;

  /// Appends the neighbours of `node` to `out`.
  fn neighbours(&self, node: Self::Node, out: &mut Vec<Self::Node>);
}

/// Horizontal tile graph, 4- or 8-connected.
#[derive(Clone, Copy, Debug)]
pub struct PlanarGraph {
  pub diagonal: bool,
}

impl PlanarGraph {
  /// 8-connected graph; hop count equals Chebyshev distance.
  pub const fn chebyshev() -> Self {
    Self { diagonal: true }
  }

  /// 4-connected graph; hop count equals Manhattan distance.
  pub const fn manhattan() -> Self {
    Self { diagonal: false }
  }
}

impl PropagationGraph for PlanarGraph {
  type Node = TilePos;

  fn neighbours(&self, node: TilePos, out: &mut Vec<TilePos>) {
    out.extend([
      node.offset(1, 0),
      node.offset(-1, 0),
      node.offset(0, 1),
      node.offset(0, -1),
    ]);
    if self.diagonal {
      out.extend([
        node.offset(1, 1),
        node.offset(1, -1),
        node.offset(-1, 1),
        node.offset(-1, -1),
      ]);
    }
  }
}

/// 26-connected section graph across a bounded range of vertical layers.
#[derive(Clone, Copy, Debug)]
pub struct VolumetricGraph {
  pub min_layer: i32,
  pub max_layer: i32,
}

impl PropagationGraph for VolumetricGraph {
  type Node = SectionPos;

  fn neighbours(&self, node: SectionPos, out: &mut Vec<SectionPos>) {
    for dy in -1..=1 {
      let y = node.y + dy;
      if y < self.min_layer || y > self.max_layer {
        continue;
      }
      for dz in -1..=1 {
        for dx in -1..=1 {
          if dx == 0 && dy == 0 && dz == 0 {
            continue;
          }
          out.push(SectionPos::new(node.x + dx, y, node.z + dz));
        }
      }
    }
  }
}

/// A settled level change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelDelta<N> {
  pub node: N,
  pub old: u8,
  pub new: u8,
}

#[derive(Clone, Copy, Debug)]
struct Node {
  source: Option<u8>,
  level: u8,
}

/// Sparse level propagator over a [`PropagationGraph`].
///
/// Not thread-safe; owned by the authoritative loop.
pub struct LevelPropagator<G: PropagationGraph> {
  graph: G,
  max_level: u8,
  nodes: HashMap<G::Node, Node>,
  pending: HashMap<G::Node, Option<u8>>,
  scratch: Vec<G::Node>,
}

impl<G: PropagationGraph> LevelPropagator<G> {
  /// Creates a propagator. Levels at or above `max_level` mean "none".
  pub fn new(graph: G, max_level: u8) -> Self {
    Self {
      graph,
      max_level,
      nodes: HashMap::new(),
      pending: HashMap::new(),
      scratch: Vec::new(),
    }
  }

  /// The level treated as "none".
  pub fn max_level(&self) -> u8 {
    self.max_level
  }

  /// Sets or clears the source level of `node`. Applied on the next
  /// [`propagate_updates`](Self::propagate_updates).
  pub fn set_source(&mut self, node: G::Node, level: Option<u8>) {
    let level = level.filter(|l| *l < self.max_level);
    self.pending.insert(node, level);
  }

  /// Settled source level of `node`.
  pub fn source(&self, node: G::Node) -> Option<u8> {
    self.nodes.get(&node).and_then(|n| n.source)
  }

  /// Settled propagated level of `node`.
  pub fn level(&self, node: G::Node) -> u8 {
    self.nodes.get(&node).map_or(self.max_level, |n| n.level)
  }

  /// Returns true if source changes are waiting to be settled.
  pub fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }

  /// Number of nodes with a source or a level below the maximum.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Settles every pending source change and returns the level deltas.
  ///
  /// Deltas are ordered by new level, most urgent first.
  pub fn propagate_updates(&mut self) -> Vec<LevelDelta<G::Node>> {
    if self.pending.is_empty() {
      return Vec::new();
    }
    let max = self.max_level;
    let mut old_levels: HashMap<G::Node, u8> = HashMap::new();
    let mut buckets: Vec<Vec<G::Node>> = vec![Vec::new(); max as usize];
    let mut increases: Vec<(G::Node, u8)> = Vec::new();

    let pending: Vec<_> = self.pending.drain().collect();
    for (id, source) in pending {
      let node = self.nodes.entry(id).or_insert(Node {
        source: None,
        level: max,
      });
      let old_source = node.source;
      let current = node.level;
      node.source = source;
      old_levels.entry(id).or_insert(current);

      match source {
        Some(s) if s < current => {
          node.level = s;
          buckets[s as usize].push(id);
        }
        _ if old_source == Some(current) && source != Some(current) && current < max => {
          // The level may have come from the old source; clear and repair.
          node.level = source.unwrap_or(max);
          if let Some(s) = source {
            buckets[s as usize].push(id);
          }
          increases.push((id, current));
        }
        _ => {}
      }
    }

    self.clear_dependents(&mut increases, &mut buckets, &mut old_levels);
    self.relax(&mut buckets, &mut old_levels);

    let mut deltas = Vec::new();
    for (id, old) in old_levels {
      let new = self.level(id);
      if new != old {
        deltas.push(LevelDelta { node: id, old, new });
      }
      if let Entry::Occupied(entry) = self.nodes.entry(id)
        && entry.get().source.is_none()
        && entry.get().level >= max
      {
        entry.remove();
      }
    }
    deltas.sort_by_key(|d| d.new);
    deltas
  }

  /// Increase pass: resets nodes whose level was exactly one hop above a
  /// raised node, cascading outward. Every other neighbour is re-seeded so
  /// the relax pass refills the cleared region from its border.
  fn clear_dependents(
    &mut self,
    increases: &mut Vec<(G::Node, u8)>,
    buckets: &mut [Vec<G::Node>],
    old_levels: &mut HashMap<G::Node, u8>,
  ) {
    let max = self.max_level;
    let mut neighbours = std::mem::take(&mut self.scratch);
    while let Some((id, previous)) = increases.pop() {
      neighbours.clear();
      self.graph.neighbours(id, &mut neighbours);
      for &n in &neighbours {
        let Some(node) = self.nodes.get_mut(&n) else {
          continue;
        };
        let level = node.level;
        if level >= max {
          continue;
        }
        if level == previous + 1 && node.source != Some(level) {
          old_levels.entry(n).or_insert(level);
          node.level = node.source.unwrap_or(max);
          if let Some(s) = node.source {
            buckets[s as usize].push(n);
          }
          increases.push((n, level));
        } else {
          buckets[level as usize].push(n);
        }
      }
    }
    self.scratch = neighbours;
  }

  /// Decrease pass: bucketed relaxation in ascending level order.
  fn relax(&mut self, buckets: &mut [Vec<G::Node>], old_levels: &mut HashMap<G::Node, u8>) {
    let max = self.max_level;
    let mut neighbours = std::mem::take(&mut self.scratch);
    for level in 0..max {
      let candidate = level + 1;
      let batch = std::mem::take(&mut buckets[level as usize]);
      for id in batch {
        if self.nodes.get(&id).is_none_or(|n| n.level != level) {
          continue; // stale
        }
        if candidate >= max {
          continue;
        }
        neighbours.clear();
        self.graph.neighbours(id, &mut neighbours);
        for &n in &neighbours {
          let node = self.nodes.entry(n).or_insert(Node {
            source: None,
            level: max,
          });
          if candidate < node.level {
            old_levels.entry(n).or_insert(node.level);
            node.level = candidate;
            buckets[candidate as usize].push(n);
          }
        }
      }
    }
    self.scratch = neighbours;
  }
}
