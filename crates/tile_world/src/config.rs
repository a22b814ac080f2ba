//! Tile world configuration loaded from TOML.

use std::path::{Path, PathBuf};

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::coords::DEFAULT_GROUP_SHIFT;

/// Tuning knobs for the tile manager, storage and viewer tickets.
///
/// Every field has a default, so a partial TOML file is valid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileWorldConfig {
  /// Container key is `coordinate >> group_shift`.
  pub group_shift: u32,
  /// Stage worker threads. 0 uses the available parallelism.
  pub worker_threads: usize,
  /// Threads performing container I/O.
  pub io_threads: usize,
  /// Ticks between autosaves of a full tile.
  pub autosave_interval_ticks: u64,
  /// Maximum autosaves per tick.
  pub max_autosaves_per_tick: usize,
  /// Minimum holders examined by the unload queue per tick.
  pub unload_min_per_tick: usize,
  /// Fraction of the unload queue examined per tick.
  pub unload_fraction: f32,
  /// Lifetime of the ticket that keeps a tile after a failed unload.
  pub unload_cooldown_ticks: u64,
  /// Outstanding I/O tasks tolerated before a flush waits.
  pub flush_backpressure: usize,
  /// World units per tile edge, used to place viewer tickets.
  pub tile_size: f32,
  /// Default viewer radius in tiles.
  pub viewer_radius: u8,
}

impl Default for TileWorldConfig {
  fn default() -> Self {
    Self {
      group_shift: DEFAULT_GROUP_SHIFT,
      worker_threads: 0,
      io_threads: 2,
      autosave_interval_ticks: 6000,
      max_autosaves_per_tick: 24,
      unload_min_per_tick: 50,
      unload_fraction: 0.05,
      unload_cooldown_ticks: 100,
      flush_backpressure: 128,
      tile_size: 16.0,
      viewer_radius: 4,
    }
  }
}

impl TileWorldConfig {
  /// Reads the config from a TOML file.
  ///
  /// Falls back to defaults (with a warning) when the file is missing or
  /// malformed.
  pub fn load(path: &Path) -> Self {
    match std::fs::read_to_string(path) {
      Ok(contents) => match toml::from_str(&contents) {
        Ok(config) => {
          info!("Loaded tile world config from {}", path.display());
          config
        }
        Err(e) => {
          warn!("Failed to parse tile world config: {e}, using defaults");
          Self::default()
        }
      },
      Err(e) => {
        warn!("Failed to read tile world config: {e}, using defaults");
        Self::default()
      }
    }
  }

  /// Serializes the config to TOML.
  pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(self)
  }

  /// Worker thread count with 0 resolved to the machine's parallelism.
  pub fn resolved_worker_threads(&self) -> usize {
    if self.worker_threads > 0 {
      return self.worker_threads;
    }
    std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(1)
      .max(1)
  }

  /// Ticks between retries of failed writes.
  pub fn write_retry_interval(&self) -> u64 {
    (self.autosave_interval_ticks / 10).max(20)
  }

  /// Number of unload queue entries examined this tick.
  pub fn unload_budget(&self, queued: usize) -> usize {
    let fraction = (queued as f32 * self.unload_fraction).ceil() as usize;
    fraction.max(self.unload_min_per_tick).min(queued)
  }
}

/// Returns the default save directory for a named world.
pub fn default_save_dir(world_name: &str) -> Option<PathBuf> {
  #[cfg(feature = "native")]
  {
    let data_dir = dirs::data_dir()?;
    Some(data_dir.join("tile_world").join(world_name))
  }
  #[cfg(not(feature = "native"))]
  {
    let _ = world_name;
    None
  }
}
