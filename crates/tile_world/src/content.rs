//! Tile content and its per-channel binary encoding.
//!
//! Each channel payload starts with a 4-byte magic, a format version and the
//! tile position, followed by little-endian records. Payloads are compressed
//! by the I/O controller, not here.

use std::io::{self, Read, Write};

use bitflags::bitflags;

use crate::coords::TilePos;
use crate::error::StageError;
use crate::status::ContentStatus;
use crate::storage::Channel;

/// Cells per tile edge.
pub const TILE_EDGE: usize = 16;

/// Cells per tile.
pub const TILE_CELLS: usize = TILE_EDGE * TILE_EDGE;

const TILES_MAGIC: u32 = 0x4C49_5454; // "TTIL"
const INDEX_MAGIC: u32 = 0x5844_4954; // "TIDX"
const ENTITIES_MAGIC: u32 = 0x544E_4554; // "TENT"
const VERSION: u16 = 1;

bitflags! {
  /// Channels with changes not yet handed to storage.
  #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
  pub struct DirtyChannels: u8 {
    const TILES = 1 << 0;
    const INDEX = 1 << 1;
    const ENTITIES = 1 << 2;
  }
}

impl DirtyChannels {
  pub const fn for_channel(channel: Channel) -> Self {
    match channel {
      Channel::Tiles => Self::TILES,
      Channel::Index => Self::INDEX,
      Channel::Entities => Self::ENTITIES,
    }
  }

  /// Channels present in the set.
  pub fn channels(self) -> impl Iterator<Item = Channel> {
    Channel::ALL
      .into_iter()
      .filter(move |c| self.contains(Self::for_channel(*c)))
  }
}

/// A point of interest inside a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
  /// Cell index within the tile.
  pub cell: u16,
  pub kind: u16,
}

/// A mobile entity stored with a tile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntityRecord {
  pub id: u64,
  /// Position in tile-local units.
  pub x: f32,
  pub z: f32,
  pub kind: u16,
}

/// Generated or loaded contents of one tile.
///
/// Shared as `Arc<TileContent>`; mutation goes through copy-on-write in the
/// manager.
#[derive(Clone, Debug, PartialEq)]
pub struct TileContent {
  pos: TilePos,
  status: ContentStatus,
  cells: Vec<u16>,
  markers: Vec<Marker>,
  entities: Vec<EntityRecord>,
  dirty: DirtyChannels,
}

impl TileContent {
  /// Fresh content for a tile absent from storage.
  pub fn new(pos: TilePos) -> Self {
    Self {
      pos,
      status: ContentStatus::Empty,
      cells: vec![0; TILE_CELLS],
      markers: Vec::new(),
      entities: Vec::new(),
      dirty: DirtyChannels::TILES,
    }
  }

  pub fn pos(&self) -> TilePos {
    self.pos
  }

  pub fn status(&self) -> ContentStatus {
    self.status
  }

  pub(crate) fn set_status(&mut self, status: ContentStatus) {
    if self.status != status {
      self.status = status;
      self.dirty |= DirtyChannels::TILES;
    }
  }

  pub fn cells(&self) -> &[u16] {
    &self.cells
  }

  pub fn cell(&self, x: usize, z: usize) -> u16 {
    self.cells[z * TILE_EDGE + x]
  }

  pub fn set_cell(&mut self, x: usize, z: usize, value: u16) {
    let cell = &mut self.cells[z * TILE_EDGE + x];
    if *cell != value {
      *cell = value;
      self.dirty |= DirtyChannels::TILES;
    }
  }

  /// Replaces every cell with `f(x, z, old)`.
  pub fn fill_cells(&mut self, mut f: impl FnMut(usize, usize, u16) -> u16) {
    for (i, cell) in self.cells.iter_mut().enumerate() {
      *cell = f(i % TILE_EDGE, i / TILE_EDGE, *cell);
    }
    self.dirty |= DirtyChannels::TILES;
  }

  pub fn markers(&self) -> &[Marker] {
    &self.markers
  }

  pub fn add_marker(&mut self, marker: Marker) {
    self.markers.push(marker);
    self.dirty |= DirtyChannels::INDEX;
  }

  /// Removes markers on `cell`; returns how many were removed.
  pub fn remove_markers_at(&mut self, cell: u16) -> usize {
    let before = self.markers.len();
    self.markers.retain(|m| m.cell != cell);
    let removed = before - self.markers.len();
    if removed > 0 {
      self.dirty |= DirtyChannels::INDEX;
    }
    removed
  }

  pub fn entities(&self) -> &[EntityRecord] {
    &self.entities
  }

  /// Inserts or replaces the entity with the same id.
  pub fn upsert_entity(&mut self, record: EntityRecord) {
    match self.entities.iter_mut().find(|e| e.id == record.id) {
      Some(existing) => *existing = record,
      None => self.entities.push(record),
    }
    self.dirty |= DirtyChannels::ENTITIES;
  }

  pub fn remove_entity(&mut self, id: u64) -> Option<EntityRecord> {
    let index = self.entities.iter().position(|e| e.id == id)?;
    self.dirty |= DirtyChannels::ENTITIES;
    Some(self.entities.remove(index))
  }

  pub fn dirty(&self) -> DirtyChannels {
    self.dirty
  }

  pub fn is_dirty(&self) -> bool {
    !self.dirty.is_empty()
  }

  pub(crate) fn mark_clean(&mut self, channels: DirtyChannels) {
    self.dirty.remove(channels);
  }

  /// Encodes one channel.
  pub fn encode(&self, channel: Channel) -> Vec<u8> {
    let mut out = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = match channel {
      Channel::Tiles => self.write_tiles(&mut out),
      Channel::Index => self.write_index(&mut out),
      Channel::Entities => self.write_entities(&mut out),
    };
    out
  }

  /// Rebuilds content from channel payloads.
  ///
  /// Returns None when the tiles channel is absent; missing index or entity
  /// payloads decode as empty.
  pub fn decode(
    pos: TilePos,
    tiles: Option<&[u8]>,
    index: Option<&[u8]>,
    entities: Option<&[u8]>,
  ) -> Result<Option<Self>, StageError> {
    let Some(tiles) = tiles else {
      return Ok(None);
    };
    let err = move |channel: Channel| {
      move |e: io::Error| StageError::Decode {
        pos,
        channel,
        reason: e.to_string(),
      }
    };

    let mut content = Self::read_tiles(pos, &mut &tiles[..]).map_err(err(Channel::Tiles))?;
    if let Some(mut bytes) = index {
      content.markers = read_index(pos, &mut bytes).map_err(err(Channel::Index))?;
    }
    if let Some(mut bytes) = entities {
      content.entities = read_entities(pos, &mut bytes).map_err(err(Channel::Entities))?;
    }
    content.dirty = DirtyChannels::empty();
    Ok(Some(content))
  }

  fn write_tiles<W: Write>(&self, w: &mut W) -> io::Result<()> {
    write_preamble(w, TILES_MAGIC, self.pos)?;
    w.write_all(&[self.status as u8])?;
    w.write_all(&(self.cells.len() as u32).to_le_bytes())?;
    for cell in &self.cells {
      w.write_all(&cell.to_le_bytes())?;
    }
    Ok(())
  }

  fn read_tiles<R: Read>(pos: TilePos, r: &mut R) -> io::Result<Self> {
    read_preamble(r, TILES_MAGIC, pos)?;
    let status = ContentStatus::from_index(read_u8(r)? as usize)
      .ok_or_else(|| invalid("unknown content status"))?;
    let count = read_u32(r)? as usize;
    if count != TILE_CELLS {
      return Err(invalid(&format!("expected {TILE_CELLS} cells, found {count}")));
    }
    let cells = (0..count).map(|_| read_u16(r)).collect::<io::Result<_>>()?;
    Ok(Self {
      pos,
      status,
      cells,
      markers: Vec::new(),
      entities: Vec::new(),
      dirty: DirtyChannels::empty(),
    })
  }

  fn write_index<W: Write>(&self, w: &mut W) -> io::Result<()> {
    write_preamble(w, INDEX_MAGIC, self.pos)?;
    w.write_all(&(self.markers.len() as u32).to_le_bytes())?;
    for marker in &self.markers {
      w.write_all(&marker.cell.to_le_bytes())?;
      w.write_all(&marker.kind.to_le_bytes())?;
    }
    Ok(())
  }

  fn write_entities<W: Write>(&self, w: &mut W) -> io::Result<()> {
    write_preamble(w, ENTITIES_MAGIC, self.pos)?;
    w.write_all(&(self.entities.len() as u32).to_le_bytes())?;
    for e in &self.entities {
      w.write_all(&e.id.to_le_bytes())?;
      w.write_all(&e.x.to_le_bytes())?;
      w.write_all(&e.z.to_le_bytes())?;
      w.write_all(&e.kind.to_le_bytes())?;
    }
    Ok(())
  }
}

fn read_index<R: Read>(pos: TilePos, r: &mut R) -> io::Result<Vec<Marker>> {
  read_preamble(r, INDEX_MAGIC, pos)?;
  let count = read_u32(r)? as usize;
  (0..count)
    .map(|_| {
      Ok(Marker {
        cell: read_u16(r)?,
        kind: read_u16(r)?,
      })
    })
    .collect()
}

fn read_entities<R: Read>(pos: TilePos, r: &mut R) -> io::Result<Vec<EntityRecord>> {
  read_preamble(r, ENTITIES_MAGIC, pos)?;
  let count = read_u32(r)? as usize;
  (0..count)
    .map(|_| {
      Ok(EntityRecord {
        id: read_u64(r)?,
        x: f32::from_bits(read_u32(r)?),
        z: f32::from_bits(read_u32(r)?),
        kind: read_u16(r)?,
      })
    })
    .collect()
}

fn invalid(reason: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

fn write_preamble<W: Write>(w: &mut W, magic: u32, pos: TilePos) -> io::Result<()> {
  w.write_all(&magic.to_le_bytes())?;
  w.write_all(&VERSION.to_le_bytes())?;
  w.write_all(&pos.x.to_le_bytes())?;
  w.write_all(&pos.z.to_le_bytes())?;
  Ok(())
}

fn read_preamble<R: Read>(r: &mut R, magic: u32, pos: TilePos) -> io::Result<()> {
  if read_u32(r)? != magic {
    return Err(invalid("bad magic"));
  }
  let version = read_u16(r)?;
  if version > VERSION {
    return Err(invalid(&format!("unsupported version {version}")));
  }
  let stored = TilePos::new(read_u32(r)? as i32, read_u32(r)? as i32);
  if stored != pos {
    return Err(invalid(&format!("payload belongs to {stored}, not {pos}")));
  }
  Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
  let mut b = [0u8; 1];
  r.read_exact(&mut b)?;
  Ok(b[0])
}

fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
  let mut b = [0u8; 2];
  r.read_exact(&mut b)?;
  Ok(u16::from_le_bytes(b))
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
  let mut b = [0u8; 4];
  r.read_exact(&mut b)?;
  Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
  let mut b = [0u8; 8];
  r.read_exact(&mut b)?;
  Ok(u64::from_le_bytes(b))
}
