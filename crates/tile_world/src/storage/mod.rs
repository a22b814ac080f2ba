//! Backing container layer.
//!
//! Tiles are grouped into containers (`coordinate >> group_shift`), one set
//! of containers per [`Channel`]. Storage implementations are synchronous and
//! are only called from the I/O pool, one job per container at a time.
//!
//! - [`RegionFileStorage`]: one file per container, page table plus data
//! - [`MemoryStorage`]: in-memory backend with failure injection

mod memory;
mod region_file;

use std::fmt;

pub use memory::MemoryStorage;
pub use region_file::RegionFileStorage;

use crate::coords::{ContainerPos, TilePos};
use crate::error::StorageError;

/// Logical data channel persisted independently per tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
  /// Cell data and generation status.
  Tiles,
  /// Point-of-interest markers.
  Index,
  /// Mobile entity records.
  Entities,
}

impl Channel {
  pub const ALL: [Channel; 3] = [Channel::Tiles, Channel::Index, Channel::Entities];

  pub const fn index(self) -> usize {
    self as usize
  }

  /// Name used for log messages and the channel's directory.
  pub const fn name(self) -> &'static str {
    match self {
      Self::Tiles => "tiles",
      Self::Index => "index",
      Self::Entities => "entities",
    }
  }
}

impl fmt::Display for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Raw byte storage grouped into containers.
///
/// Payloads are opaque; compression happens in the I/O controller.
pub trait RegionStorage: Send + Sync {
  /// Group shift used to map tiles to containers.
  fn group_shift(&self) -> u32;

  /// Cheap presence check. False means the tile is definitely absent.
  fn exists(&self, pos: TilePos) -> bool;

  /// Reads the stored payload, or None if absent.
  fn read_raw(&self, pos: TilePos) -> Result<Option<Vec<u8>>, StorageError>;

  /// Stores `data`, or deletes the entry when `data` is None.
  fn write_raw(&self, pos: TilePos, data: Option<&[u8]>) -> Result<(), StorageError>;

  /// Makes writes to one container durable.
  fn flush_container(&self, container: ContainerPos) -> Result<(), StorageError>;

  /// Makes every write durable.
  fn flush(&self) -> Result<(), StorageError>;

  /// Flushes and releases every container. Later calls fail with
  /// [`StorageError::Closed`].
  fn close(&self) -> Result<(), StorageError>;

  /// Container for `pos`.
  fn container_of(&self, pos: TilePos) -> ContainerPos {
    pos.container(self.group_shift())
  }
}
