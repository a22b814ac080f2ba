//! Bevy integration.
//!
//! [`TileWorldPlugin`] owns a [`TileManager`] as the [`TileWorld`] resource,
//! turns [`TileViewer`] entities into viewer tickets and ticks the manager
//! once per frame in `PreUpdate`. Full status changes are forwarded as
//! [`TileFullStatusChanged`] messages. The world is saved and closed when the
//! app exits.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use bevy::prelude::*;

use crate::config::TileWorldConfig;
use crate::coords::TilePos;
use crate::generator::{FlatGenerator, StageGenerator};
use crate::manager::TileManager;
use crate::status::{self, FullStatus};
use crate::ticket::{TicketKind, TicketOwner};

/// Adds a tile world to the app.
pub struct TileWorldPlugin {
  pub config: TileWorldConfig,
  /// Persist tiles here; `None` keeps everything in memory.
  pub save_dir: Option<PathBuf>,
  pub generator: Arc<dyn StageGenerator>,
}

impl Default for TileWorldPlugin {
  fn default() -> Self {
    Self::in_memory(Arc::new(FlatGenerator::default()))
  }
}

impl TileWorldPlugin {
  /// A persistent world saved under `save_dir`.
  pub fn new(save_dir: impl Into<PathBuf>, generator: Arc<dyn StageGenerator>) -> Self {
    Self {
      config: TileWorldConfig::default(),
      save_dir: Some(save_dir.into()),
      generator,
    }
  }

  /// A world that is never written to disk.
  pub fn in_memory(generator: Arc<dyn StageGenerator>) -> Self {
    Self {
      config: TileWorldConfig::default(),
      save_dir: None,
      generator,
    }
  }

  /// Sets the configuration.
  pub fn config(mut self, config: TileWorldConfig) -> Self {
    self.config = config;
    self
  }
}

impl Plugin for TileWorldPlugin {
  fn build(&self, app: &mut App) {
    let config = self.config.clone();
    let generator = Arc::clone(&self.generator);
    let manager = match &self.save_dir {
      Some(dir) => TileManager::open(config, dir, generator),
      None => TileManager::in_memory(config, generator),
    };
    let manager = match manager {
      Ok(manager) => manager,
      Err(e) => {
        error!("Failed to open tile world: {e}");
        return;
      }
    };

    app
      .insert_resource(TileWorld(manager))
      .add_message::<TileFullStatusChanged>()
      .add_systems(
        PreUpdate,
        (apply_viewer_tickets, tick_tile_world).chain(),
      )
      .add_systems(Last, close_on_exit);
  }
}

/// The app's tile manager.
#[derive(Resource, Deref, DerefMut)]
pub struct TileWorld(pub TileManager);

/// Keeps tiles around this entity loaded.
///
/// The tile under the entity's `Transform` (x/z plane) becomes Full along
/// with everything within `radius` tiles.
#[derive(Component, Clone, Copy, Debug)]
pub struct TileViewer {
  pub radius: u8,
}

impl Default for TileViewer {
  fn default() -> Self {
    Self {
      radius: TileWorldConfig::default().viewer_radius,
    }
  }
}

/// Sent when a tile's full status changes.
#[derive(Message, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileFullStatusChanged {
  pub pos: TilePos,
  pub old: FullStatus,
  pub new: FullStatus,
}

/// Ticket placed for a viewer: centre tile and level.
type ViewerTicket = (TilePos, u8);

fn viewer_owner(entity: Entity) -> TicketOwner {
  TicketOwner(entity.to_bits())
}

fn viewer_level(radius: u8) -> u8 {
  status::FULL_LEVEL.saturating_sub(radius)
}

/// Tile containing a world-space position.
pub fn tile_at(translation: Vec3, tile_size: f32) -> TilePos {
  TilePos::new(
    (translation.x / tile_size).floor() as i32,
    (translation.z / tile_size).floor() as i32,
  )
}

/// Moves viewer tickets to follow their entities.
#[cfg_attr(feature = "tracy", tracing::instrument(skip_all))]
fn apply_viewer_tickets(
  world: Res<TileWorld>,
  viewers: Query<(Entity, &TileViewer, &Transform)>,
  mut placed: Local<HashMap<Entity, ViewerTicket>>,
) {
  let tile_size = world.config().tile_size;
  let mut seen = HashSet::new();

  for (entity, viewer, transform) in &viewers {
    seen.insert(entity);
    let ticket = (
      tile_at(transform.translation, tile_size),
      viewer_level(viewer.radius),
    );
    if placed.get(&entity) == Some(&ticket) {
      continue;
    }

    let owner = viewer_owner(entity);
    // Add before removing so the shared area never drops out.
    if let Err(e) = world.add_ticket(ticket.0, TicketKind::Viewer, ticket.1, owner, None) {
      warn!("Failed to place viewer ticket at {}: {e}", ticket.0);
      continue;
    }
    if let Some((pos, level)) = placed.insert(entity, ticket) {
      world.remove_ticket(pos, TicketKind::Viewer, level, owner);
    }
  }

  placed.retain(|entity, (pos, level)| {
    let alive = seen.contains(entity);
    if !alive {
      world.remove_ticket(*pos, TicketKind::Viewer, *level, viewer_owner(*entity));
    }
    alive
  });
}

/// Advances the tile world and forwards full status changes.
#[cfg_attr(feature = "tracy", tracing::instrument(skip_all))]
fn tick_tile_world(
  mut world: ResMut<TileWorld>,
  mut changes: MessageWriter<TileFullStatusChanged>,
  mut exit: MessageWriter<AppExit>,
) {
  if world.is_closed() {
    return;
  }
  if let Err(e) = world.tick() {
    error!("Tile world failed: {e}");
    exit.write(AppExit::error());
    return;
  }
  for change in world.drain_full_status_changes() {
    changes.write(TileFullStatusChanged {
      pos: change.pos,
      old: change.old,
      new: change.new,
    });
  }
}

fn close_on_exit(mut world: ResMut<TileWorld>, mut exits: MessageReader<AppExit>) {
  if exits.read().next().is_none() || world.is_closed() {
    return;
  }
  info!("Closing tile world");
  if let Err(e) = world.close(true) {
    error!("Tile world closed with errors: {e}");
  }
}
