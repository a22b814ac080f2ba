//! Stage functions.
//!
//! A [`StageGenerator`] advances tile content by one [`ContentStatus`]. The
//! manager calls it with a [`StageContext`] holding read-only snapshots of the
//! neighbours the stage depends on; the generator never sees holders.

use std::collections::HashMap;
use std::error::Error;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::content::{EntityRecord, Marker, TILE_EDGE, TileContent};
use crate::coords::TilePos;
use crate::error::StageError;
use crate::executor::panic_message;
use crate::status::ContentStatus;

/// Inputs to one stage run.
pub struct StageContext<'a> {
  pub pos: TilePos,
  /// Status being produced.
  pub status: ContentStatus,
  neighbours: &'a HashMap<TilePos, Arc<TileContent>>,
}

impl<'a> StageContext<'a> {
  pub fn new(
    pos: TilePos,
    status: ContentStatus,
    neighbours: &'a HashMap<TilePos, Arc<TileContent>>,
  ) -> Self {
    Self {
      pos,
      status,
      neighbours,
    }
  }

  /// Snapshot of a neighbour within the stage's radius.
  pub fn neighbour(&self, pos: TilePos) -> Option<&TileContent> {
    self.neighbours.get(&pos).map(Arc::as_ref)
  }

  pub fn neighbours(&self) -> impl Iterator<Item = &TileContent> {
    self.neighbours.values().map(Arc::as_ref)
  }
}

/// Produces content for each generation stage.
pub trait StageGenerator: Send + Sync + 'static {
  /// Advances `content` to `ctx.status`.
  fn generate(
    &self,
    ctx: &StageContext<'_>,
    content: &mut TileContent,
  ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Runs a stage, converting errors and panics into [`StageError`].
pub fn run_stage(
  generator: &dyn StageGenerator,
  ctx: &StageContext<'_>,
  content: &mut TileContent,
) -> Result<(), StageError> {
  let failed = |message: String| StageError::Generator {
    pos: ctx.pos,
    status: ctx.status,
    message,
  };
  match catch_unwind(AssertUnwindSafe(|| generator.generate(ctx, content))) {
    Ok(Ok(())) => {
      content.set_status(ctx.status);
      Ok(())
    }
    Ok(Err(e)) => Err(failed(e.to_string())),
    Err(payload) => Err(failed(format!(
      "panicked: {}",
      panic_message(payload.as_ref())
    ))),
  }
}

fn hash2(seed: u64, x: i32, z: i32) -> u64 {
  let mut h = seed ^ ((x as u32 as u64) << 32 | z as u32 as u64);
  h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
  h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
  h ^ (h >> 31)
}

/// Deterministic generator producing terrain-like cell values.
///
/// Cell layout: biome in the high byte, height in the low byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlatGenerator {
  pub seed: u64,
}

impl FlatGenerator {
  pub const fn new(seed: u64) -> Self {
    Self { seed }
  }

  fn biome(&self, pos: TilePos) -> u16 {
    (hash2(self.seed, pos.x, pos.z) % 4) as u16
  }
}

impl StageGenerator for FlatGenerator {
  fn generate(
    &self,
    ctx: &StageContext<'_>,
    content: &mut TileContent,
  ) -> Result<(), Box<dyn Error + Send + Sync>> {
    let pos = ctx.pos;
    match ctx.status {
      ContentStatus::Empty | ContentStatus::StructureReferences | ContentStatus::Full => {}
      ContentStatus::StructureStarts => {
        let h = hash2(self.seed ^ 0x5354, pos.x, pos.z);
        if h % 4 == 0 {
          content.add_marker(Marker {
            cell: (h % (TILE_EDGE * TILE_EDGE) as u64) as u16,
            kind: 1,
          });
        }
      }
      ContentStatus::Biomes => {
        let biome = self.biome(pos);
        content.fill_cells(|_, _, _| biome << 8);
      }
      ContentStatus::Noise => {
        let seed = self.seed;
        content.fill_cells(|x, z, cell| {
          let wx = pos.x.wrapping_mul(TILE_EDGE as i32).wrapping_add(x as i32);
          let wz = pos.z.wrapping_mul(TILE_EDGE as i32).wrapping_add(z as i32);
          (cell & 0xff00) | (hash2(seed, wx, wz) % 64) as u16 + 32
        });
      }
      ContentStatus::Surface => {
        content.fill_cells(|_, _, cell| cell.saturating_add(4));
      }
      ContentStatus::Carvers => {
        let h = hash2(self.seed ^ 0xca7e, pos.x, pos.z);
        let (cx, cz) = ((h % 16) as usize, ((h >> 8) % 16) as usize);
        content.set_cell(cx, cz, content.cell(cx, cz) & 0xff00);
      }
      ContentStatus::Features => {
        // Trees grow taller when the surrounding terrain is higher.
        let around: u32 = ctx
          .neighbours()
          .map(|n| (n.cell(0, 0) & 0xff) as u32)
          .sum();
        let count = ctx.neighbours().count().max(1) as u32;
        let height = (around / count) as u16 & 0xff;
        content.set_cell(8, 8, (content.cell(8, 8) & 0xff00) | height);
      }
      ContentStatus::InitializeLight | ContentStatus::Light => {}
      ContentStatus::Spawn => {
        let h = hash2(self.seed ^ 0x5a17, pos.x, pos.z);
        if h % 3 == 0 {
          content.upsert_entity(EntityRecord {
            id: h,
            x: (h % 16) as f32 + 0.5,
            z: ((h >> 4) % 16) as f32 + 0.5,
            kind: (h % 5) as u16,
          });
        }
      }
    }
    Ok(())
  }
}
