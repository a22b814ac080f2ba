//! Content statuses, the dependency pyramid and ticket level mapping.
//!
//! A tile advances through [`ContentStatus`] stages one at a time. Each stage
//! may require neighbouring tiles to have reached a lesser stage within some
//! radius; chaining these requirements gives the accumulated footprint that
//! ticket levels must keep resident around a tile.

use std::fmt;
use std::sync::OnceLock;

/// Level at which a tile is kept at [`ContentStatus::Full`].
pub const FULL_LEVEL: u8 = 33;

/// Level at which a full tile may tick blocks.
pub const BLOCK_TICKING_LEVEL: u8 = 32;

/// Level at which a full tile may tick entities.
pub const ENTITY_TICKING_LEVEL: u8 = 31;

/// Upper bound for the accumulated dependency distance table.
const MAX_DEPENDENCY_DISTANCE: usize = 32;

/// Ordered generation stages of a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ContentStatus {
  /// Loaded from storage, or freshly created when absent on disk.
  Empty = 0,
  StructureStarts,
  StructureReferences,
  Biomes,
  Noise,
  Surface,
  Carvers,
  Features,
  InitializeLight,
  Light,
  Spawn,
  /// Completely generated and usable by the simulation.
  Full,
}

impl ContentStatus {
  /// All statuses in order.
  pub const ALL: [ContentStatus; 12] = [
    ContentStatus::Empty,
    ContentStatus::StructureStarts,
    ContentStatus::StructureReferences,
    ContentStatus::Biomes,
    ContentStatus::Noise,
    ContentStatus::Surface,
    ContentStatus::Carvers,
    ContentStatus::Features,
    ContentStatus::InitializeLight,
    ContentStatus::Light,
    ContentStatus::Spawn,
    ContentStatus::Full,
  ];

  /// Number of statuses.
  pub const COUNT: usize = Self::ALL.len();

  pub const fn index(self) -> usize {
    self as usize
  }

  pub fn from_index(index: usize) -> Option<Self> {
    Self::ALL.get(index).copied()
  }

  /// The status after this one, or None for [`ContentStatus::Full`].
  pub fn next(self) -> Option<Self> {
    Self::from_index(self.index() + 1)
  }

  /// The status before this one, or None for [`ContentStatus::Empty`].
  pub fn prev(self) -> Option<Self> {
    self.index().checked_sub(1).and_then(Self::from_index)
  }

  pub const fn name(self) -> &'static str {
    match self {
      Self::Empty => "empty",
      Self::StructureStarts => "structure_starts",
      Self::StructureReferences => "structure_references",
      Self::Biomes => "biomes",
      Self::Noise => "noise",
      Self::Surface => "surface",
      Self::Carvers => "carvers",
      Self::Features => "features",
      Self::InitializeLight => "initialize_light",
      Self::Light => "light",
      Self::Spawn => "spawn",
      Self::Full => "full",
    }
  }

  /// Statuses neighbours must have reached before this stage may run.
  ///
  /// Entry `i` applies to every neighbour at Chebyshev distance `i + 1`.
  /// Entries never increase with radius and are always below `self`.
  pub const fn neighbour_requirements(self) -> &'static [ContentStatus] {
    use ContentStatus::*;
    match self {
      StructureReferences | Biomes => &[StructureStarts, StructureStarts],
      Noise => &[Biomes, StructureStarts],
      Surface => &[Noise],
      Carvers => &[Surface],
      Features => &[Carvers],
      Light => &[InitializeLight],
      Empty | StructureStarts | InitializeLight | Spawn | Full => &[],
    }
  }

  /// Largest neighbour radius this stage reads.
  pub const fn neighbour_radius(self) -> u32 {
    self.neighbour_requirements().len() as u32
  }

  /// Status required of a neighbour at `radius` for this stage to run.
  pub fn required_at(self, radius: u32) -> Option<ContentStatus> {
    if radius == 0 {
      return self.prev();
    }
    self
      .neighbour_requirements()
      .get(radius as usize - 1)
      .copied()
  }

  /// Whether the stage function may run on the worker pool.
  ///
  /// Stages that touch shared neighbour state run on the authoritative thread.
  pub const fn is_parallel(self) -> bool {
    !matches!(self, Self::Light | Self::Full)
  }

  /// Whether this stage is satisfied by loading from storage.
  ///
  /// When the tile is absent on disk, loading it is a no-op that produces
  /// fresh content instead of an error.
  pub const fn is_load_stage(self) -> bool {
    matches!(self, Self::Empty)
  }
}

impl fmt::Display for ContentStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Simulation readiness of a fully generated tile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FullStatus {
  /// Not full, or not kept at a full level.
  #[default]
  Inaccessible,
  /// Full and visible, but not ticking.
  Full,
  /// Full with all neighbours within radius 1 full.
  BlockTicking,
  /// Full with all neighbours within radius 2 full.
  EntityTicking,
}

impl FullStatus {
  /// Neighbour radius that must be full for this status.
  pub const fn required_radius(self) -> u32 {
    match self {
      Self::Inaccessible | Self::Full => 0,
      Self::BlockTicking => 1,
      Self::EntityTicking => 2,
    }
  }

  /// Upper bound allowed by a ticket level.
  pub const fn for_level(level: u8) -> Self {
    if level <= ENTITY_TICKING_LEVEL {
      Self::EntityTicking
    } else if level <= BLOCK_TICKING_LEVEL {
      Self::BlockTicking
    } else if level <= FULL_LEVEL {
      Self::Full
    } else {
      Self::Inaccessible
    }
  }
}

/// Accumulated requirements: `need[s][d]` is the status a tile at distance
/// `d` must reach before a tile can reach status `s`.
struct Pyramid {
  need: [[Option<ContentStatus>; MAX_DEPENDENCY_DISTANCE + 1]; ContentStatus::COUNT],
}

impl Pyramid {
  fn build() -> Self {
    let mut need = [[None; MAX_DEPENDENCY_DISTANCE + 1]; ContentStatus::COUNT];
    for status in ContentStatus::ALL {
      let s = status.index();
      need[s][0] = Some(status);
      for d in 1..=MAX_DEPENDENCY_DISTANCE {
        // Reaching `status` first requires reaching the previous one
        let mut required = status.prev().and_then(|p| need[p.index()][d]);
        for (i, req) in status.neighbour_requirements().iter().enumerate() {
          let r = i + 1;
          if r > d {
            break;
          }
          required = required.max(need[req.index()][d - r]);
        }
        need[s][d] = required;
      }
    }
    Self { need }
  }

  fn get() -> &'static Pyramid {
    static PYRAMID: OnceLock<Pyramid> = OnceLock::new();
    PYRAMID.get_or_init(Pyramid::build)
  }
}

/// Status a tile at `distance` must reach so a tile can reach `target`.
pub fn required_status_at_distance(target: ContentStatus, distance: u32) -> Option<ContentStatus> {
  let d = distance as usize;
  if d > MAX_DEPENDENCY_DISTANCE {
    return None;
  }
  Pyramid::get().need[target.index()][d]
}

/// Largest distance at which `target` still requires anything.
pub fn max_dependency_distance(target: ContentStatus) -> u32 {
  let row = &Pyramid::get().need[target.index()];
  row.iter().rposition(Option::is_some).unwrap_or(0) as u32
}

/// Highest level that still keeps a tile resident.
pub fn max_loaded_level() -> u8 {
  FULL_LEVEL + max_dependency_distance(ContentStatus::Full) as u8
}

/// Level meaning "not loaded"; every level at or above it is equivalent.
pub fn unloaded_level() -> u8 {
  max_loaded_level() + 1
}

/// Content status a tile at `level` is driven towards.
pub fn status_for_level(level: u8) -> Option<ContentStatus> {
  if level <= FULL_LEVEL {
    Some(ContentStatus::Full)
  } else {
    required_status_at_distance(ContentStatus::Full, (level - FULL_LEVEL) as u32)
  }
}

/// Least urgent level whose target is at least `status`.
pub fn level_for_status(status: ContentStatus) -> u8 {
  if status == ContentStatus::Full {
    return FULL_LEVEL;
  }
  let mut level = FULL_LEVEL;
  while level < max_loaded_level() && status_for_level(level + 1).is_some_and(|s| s >= status) {
    level += 1;
  }
  level
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn requirements_are_monotonic_and_below_target() {
    for status in ContentStatus::ALL {
      let reqs = status.neighbour_requirements();
      for pair in reqs.windows(2) {
        assert!(pair[0] >= pair[1], "{status}: requirements increase with radius");
      }
      for req in reqs {
        assert!(*req < status, "{status}: requirement {req} is not lesser");
      }
    }
  }

  #[test]
  fn full_pyramid_matches_stage_table() {
    use ContentStatus::*;
    let expected = [
      Some(Full),
      Some(InitializeLight),
      Some(Carvers),
      Some(Surface),
      Some(Noise),
      Some(Biomes),
      Some(StructureStarts),
      Some(StructureStarts),
      None,
    ];
    for (d, want) in expected.iter().enumerate() {
      assert_eq!(required_status_at_distance(Full, d as u32), *want, "distance {d}");
    }
    assert_eq!(max_dependency_distance(Full), 7);
    assert_eq!(max_loaded_level(), 40);
    assert_eq!(unloaded_level(), 41);
  }

  #[test]
  fn pyramid_is_non_increasing_with_distance() {
    for status in ContentStatus::ALL {
      let mut last = Some(status);
      for d in 0..=MAX_DEPENDENCY_DISTANCE as u32 {
        let cur = required_status_at_distance(status, d);
        assert!(cur <= last, "{status} at {d}");
        last = cur;
      }
    }
  }

  #[test]
  fn level_and_status_mapping_agree() {
    assert_eq!(status_for_level(20), Some(ContentStatus::Full));
    assert_eq!(status_for_level(FULL_LEVEL), Some(ContentStatus::Full));
    assert_eq!(status_for_level(34), Some(ContentStatus::InitializeLight));
    assert_eq!(status_for_level(unloaded_level()), None);

    for status in ContentStatus::ALL {
      let level = level_for_status(status);
      assert!(status_for_level(level).is_some_and(|s| s >= status));
      if level < max_loaded_level() {
        assert!(status_for_level(level + 1).is_none_or(|s| s < status));
      }
    }
    assert_eq!(level_for_status(ContentStatus::Features), 34);
    assert_eq!(level_for_status(ContentStatus::Empty), 40);
  }

  #[test]
  fn full_status_by_level() {
    assert_eq!(FullStatus::for_level(30), FullStatus::EntityTicking);
    assert_eq!(FullStatus::for_level(32), FullStatus::BlockTicking);
    assert_eq!(FullStatus::for_level(33), FullStatus::Full);
    assert_eq!(FullStatus::for_level(34), FullStatus::Inaccessible);
  }

  #[test]
  fn only_light_and_full_are_serial() {
    let serial: Vec<_> = ContentStatus::ALL
      .into_iter()
      .filter(|s| !s.is_parallel())
      .collect();
    assert_eq!(serial, vec![ContentStatus::Light, ContentStatus::Full]);
  }
}
