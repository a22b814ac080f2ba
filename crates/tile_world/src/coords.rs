//! Coordinate types for the tile grid.
//!
//! Defines the coordinate system used throughout the crate:
//! - [`TilePos`]: Column position in the infinite tile grid (i32 pair)
//! - [`ContainerPos`]: Backing container holding a square group of tiles
//! - [`SectionPos`]: Tile column plus a vertical layer, for volumetric graphs
//!
//! Every position packs into a 64-bit key for map lookups.

use std::fmt;

/// Default container group shift (32x32 tiles per container).
pub const DEFAULT_GROUP_SHIFT: u32 = 5;

/// Tile grid position.
///
/// Uses i32 coordinates, matching the packed 64-bit key layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TilePos {
  pub x: i32,
  pub z: i32,
}

impl TilePos {
  /// Creates a new tile position.
  pub const fn new(x: i32, z: i32) -> Self {
    Self { x, z }
  }

  /// Packs the position into a 64-bit key (z in the high half).
  pub const fn key(self) -> u64 {
    ((self.z as u32 as u64) << 32) | (self.x as u32 as u64)
  }

  /// Unpacks a position from a key produced by [`TilePos::key`].
  pub const fn from_key(key: u64) -> Self {
    Self {
      x: key as u32 as i32,
      z: (key >> 32) as u32 as i32,
    }
  }

  /// Returns the position offset by `(dx, dz)`.
  pub const fn offset(self, dx: i32, dz: i32) -> Self {
    Self::new(self.x.wrapping_add(dx), self.z.wrapping_add(dz))
  }

  /// Chebyshev distance to another tile.
  pub fn chebyshev(self, other: TilePos) -> u32 {
    let dx = (self.x as i64 - other.x as i64).unsigned_abs();
    let dz = (self.z as i64 - other.z as i64).unsigned_abs();
    dx.max(dz).min(u32::MAX as u64) as u32
  }

  /// Returns the container holding this tile.
  ///
  /// Arithmetic shift, so negative tiles map to negative containers.
  pub const fn container(self, group_shift: u32) -> ContainerPos {
    ContainerPos::new(self.x >> group_shift, self.z >> group_shift)
  }

  /// Index of this tile inside its container, row-major.
  pub const fn local_index(self, group_shift: u32) -> usize {
    let mask = (1i32 << group_shift) - 1;
    (((self.z & mask) << group_shift) | (self.x & mask)) as usize
  }

  /// Iterates all tiles within `radius` (Chebyshev), row by row.
  ///
  /// Includes the centre tile.
  pub fn square(self, radius: u32) -> impl Iterator<Item = TilePos> {
    let r = radius as i32;
    (-r..=r).flat_map(move |dz| (-r..=r).map(move |dx| self.offset(dx, dz)))
  }

  /// Iterates tiles within `radius`, excluding the centre.
  pub fn neighbours_within(self, radius: u32) -> impl Iterator<Item = TilePos> {
    self.square(radius).filter(move |p| *p != self)
  }
}

impl fmt::Display for TilePos {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {})", self.x, self.z)
  }
}

/// Position of a backing container in container-grid units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerPos {
  pub x: i32,
  pub z: i32,
}

impl ContainerPos {
  pub const fn new(x: i32, z: i32) -> Self {
    Self { x, z }
  }

  /// Packs the container position into a 64-bit key.
  pub const fn key(self) -> u64 {
    TilePos::new(self.x, self.z).key()
  }

  /// File name used by the region file backend.
  pub fn file_name(self) -> String {
    format!("r.{}.{}.tile", self.x, self.z)
  }
}

impl fmt::Display for ContainerPos {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}, {}]", self.x, self.z)
  }
}

/// A tile column plus a vertical layer index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionPos {
  pub x: i32,
  pub y: i32,
  pub z: i32,
}

impl SectionPos {
  pub const fn new(x: i32, y: i32, z: i32) -> Self {
    Self { x, y, z }
  }

  /// The tile column containing this section.
  pub const fn tile(self) -> TilePos {
    TilePos::new(self.x, self.z)
  }
}
