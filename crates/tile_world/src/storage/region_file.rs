//! File-per-container storage.
//!
//! Layout of a container file:
//! - header (16 bytes): magic, version, group shift, slot count
//! - page table: one [`Slot`] (12 bytes) per tile in the container
//! - data region: payloads appended at the end of the file
//!
//! A rewrite reuses the old extent when the new payload fits, otherwise it
//! appends. Deleting a tile clears its slot.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bevy::log::debug;

use super::RegionStorage;
use crate::coords::{ContainerPos, TilePos};
use crate::error::StorageError;

/// Magic bytes identifying a container file ("TRGN").
const MAGIC: u32 = 0x4E47_5254;

/// Current container format version.
const VERSION: u16 = 1;

const HEADER_SIZE: u64 = 16;
const SLOT_SIZE: usize = 12;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
  let mut b = [0u8; 2];
  b.copy_from_slice(&buf[at..at + 2]);
  u16::from_le_bytes(b)
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
  let mut b = [0u8; 4];
  b.copy_from_slice(&buf[at..at + 4]);
  u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
  let mut b = [0u8; 8];
  b.copy_from_slice(&buf[at..at + 8]);
  u64::from_le_bytes(b)
}

/// Page table entry. `len == 0` means the tile is absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Slot {
  offset: u64,
  len: u32,
}

impl Slot {
  fn to_bytes(self) -> [u8; SLOT_SIZE] {
    let mut out = [0u8; SLOT_SIZE];
    out[0..8].copy_from_slice(&self.offset.to_le_bytes());
    out[8..12].copy_from_slice(&self.len.to_le_bytes());
    out
  }
}

struct ContainerFile {
  pos: ContainerPos,
  file: fs::File,
  slots: Vec<Slot>,
  end: u64,
  unsynced: bool,
}

impl ContainerFile {
  fn table_end(slot_count: usize) -> u64 {
    HEADER_SIZE + (slot_count * SLOT_SIZE) as u64
  }

  fn create(pos: ContainerPos, path: &Path, group_shift: u32) -> Result<Self, StorageError> {
    let slot_count = 1usize << (2 * group_shift);
    let mut file = fs::File::options()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .open(path)?;

    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&(group_shift as u16).to_le_bytes());
    header[8..12].copy_from_slice(&(slot_count as u32).to_le_bytes());
    file.write_all(&header)?;
    file.write_all(&vec![0u8; slot_count * SLOT_SIZE])?;

    Ok(Self {
      pos,
      file,
      slots: vec![Slot::default(); slot_count],
      end: Self::table_end(slot_count),
      unsynced: true,
    })
  }

  fn open(pos: ContainerPos, path: &Path, group_shift: u32) -> Result<Self, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
      container: pos,
      reason,
    };
    let mut file = fs::File::options().read(true).write(true).open(path)?;

    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)?;
    if le_u32(&header, 0) != MAGIC {
      return Err(corrupt("bad magic".into()));
    }
    let version = le_u16(&header, 4);
    if version > VERSION {
      return Err(corrupt(format!("unsupported version {version}")));
    }
    let shift = le_u16(&header, 6) as u32;
    if shift != group_shift {
      return Err(corrupt(format!(
        "group shift {shift} does not match configured {group_shift}"
      )));
    }
    let slot_count = le_u32(&header, 8) as usize;
    if slot_count != 1usize << (2 * group_shift) {
      return Err(corrupt(format!("unexpected slot count {slot_count}")));
    }

    let mut table = vec![0u8; slot_count * SLOT_SIZE];
    file.read_exact(&mut table)?;
    let slots: Vec<Slot> = table
      .chunks_exact(SLOT_SIZE)
      .map(|raw| Slot {
        offset: le_u64(raw, 0),
        len: le_u32(raw, 8),
      })
      .collect();

    let file_len = file.metadata()?.len();
    if let Some(slot) = slots
      .iter()
      .find(|s| s.len > 0 && s.offset + s.len as u64 > file_len)
    {
      return Err(corrupt(format!(
        "slot extent {}+{} past end of file {file_len}",
        slot.offset, slot.len
      )));
    }

    Ok(Self {
      pos,
      file,
      slots,
      end: file_len.max(Self::table_end(slot_count)),
      unsynced: false,
    })
  }

  fn read(&mut self, index: usize) -> Result<Option<Vec<u8>>, StorageError> {
    let slot = self.slots[index];
    if slot.len == 0 {
      return Ok(None);
    }
    let mut data = vec![0u8; slot.len as usize];
    self.file.seek(SeekFrom::Start(slot.offset))?;
    self.file.read_exact(&mut data)?;
    Ok(Some(data))
  }

  fn write(&mut self, index: usize, data: Option<&[u8]>) -> Result<(), StorageError> {
    let old = self.slots[index];
    let slot = match data {
      None | Some([]) => Slot::default(),
      Some(bytes) => {
        let len = u32::try_from(bytes.len()).map_err(|_| StorageError::Corrupt {
          container: self.pos,
          reason: format!("payload of {} bytes too large", bytes.len()),
        })?;
        let offset = if old.len >= len { old.offset } else { self.end };
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.end = self.end.max(offset + len as u64);
        Slot { offset, len }
      }
    };
    self
      .file
      .seek(SeekFrom::Start(HEADER_SIZE + (index * SLOT_SIZE) as u64))?;
    self.file.write_all(&slot.to_bytes())?;
    self.slots[index] = slot;
    self.unsynced = true;
    Ok(())
  }

  fn sync(&mut self) -> Result<(), StorageError> {
    if self.unsynced {
      self.file.sync_all()?;
      self.unsynced = false;
    }
    Ok(())
  }
}

/// Region file storage rooted at a directory.
pub struct RegionFileStorage {
  dir: PathBuf,
  group_shift: u32,
  open: Mutex<HashMap<ContainerPos, Arc<Mutex<ContainerFile>>>>,
  /// Containers known to have no file on disk.
  absent: Mutex<HashSet<ContainerPos>>,
  closed: AtomicBool,
}

impl RegionFileStorage {
  /// Opens storage in `dir`, creating the directory if needed.
  pub fn open(dir: impl Into<PathBuf>, group_shift: u32) -> Result<Self, StorageError> {
    let dir = dir.into();
    fs::create_dir_all(&dir)?;
    Ok(Self {
      dir,
      group_shift,
      open: Mutex::new(HashMap::new()),
      absent: Mutex::new(HashSet::new()),
      closed: AtomicBool::new(false),
    })
  }

  fn path(&self, container: ContainerPos) -> PathBuf {
    self.dir.join(container.file_name())
  }

  fn check_open(&self) -> Result<(), StorageError> {
    if self.closed.load(Ordering::Acquire) {
      Err(StorageError::Closed)
    } else {
      Ok(())
    }
  }

  /// Returns the container file, opening it if it exists on disk. With
  /// `create`, a missing file is created.
  fn container(
    &self,
    container: ContainerPos,
    create: bool,
  ) -> Result<Option<Arc<Mutex<ContainerFile>>>, StorageError> {
    self.check_open()?;
    if let Some(file) = lock(&self.open).get(&container) {
      return Ok(Some(Arc::clone(file)));
    }
    if !create && lock(&self.absent).contains(&container) {
      return Ok(None);
    }

    let path = self.path(container);
    let file = if path.exists() {
      ContainerFile::open(container, &path, self.group_shift)?
    } else if create {
      debug!("Creating container {}", path.display());
      ContainerFile::create(container, &path, self.group_shift)?
    } else {
      lock(&self.absent).insert(container);
      return Ok(None);
    };

    lock(&self.absent).remove(&container);
    let file = Arc::new(Mutex::new(file));
    let mut open = lock(&self.open);
    Ok(Some(Arc::clone(open.entry(container).or_insert(file))))
  }
}

impl RegionStorage for RegionFileStorage {
  fn group_shift(&self) -> u32 {
    self.group_shift
  }

  fn exists(&self, pos: TilePos) -> bool {
    let container = self.container_of(pos);
    if lock(&self.absent).contains(&container) {
      return false;
    }
    match self.container(container, false) {
      Ok(Some(file)) => lock(&file).slots[pos.local_index(self.group_shift)].len > 0,
      Ok(None) => false,
      // Unknown; let the read report the error.
      Err(_) => true,
    }
  }

  fn read_raw(&self, pos: TilePos) -> Result<Option<Vec<u8>>, StorageError> {
    match self.container(self.container_of(pos), false)? {
      Some(file) => lock(&file).read(pos.local_index(self.group_shift)),
      None => Ok(None),
    }
  }

  fn write_raw(&self, pos: TilePos, data: Option<&[u8]>) -> Result<(), StorageError> {
    let create = data.is_some_and(|d| !d.is_empty());
    match self.container(self.container_of(pos), create)? {
      Some(file) => lock(&file).write(pos.local_index(self.group_shift), data),
      None => Ok(()),
    }
  }

  fn flush_container(&self, container: ContainerPos) -> Result<(), StorageError> {
    self.check_open()?;
    let file = lock(&self.open).get(&container).cloned();
    match file {
      Some(file) => lock(&file).sync(),
      None => Ok(()),
    }
  }

  fn flush(&self) -> Result<(), StorageError> {
    self.check_open()?;
    let files: Vec<_> = lock(&self.open).values().cloned().collect();
    for file in files {
      lock(&file).sync()?;
    }
    Ok(())
  }

  fn close(&self) -> Result<(), StorageError> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let files: Vec<_> = lock(&self.open).drain().map(|(_, f)| f).collect();
    let mut first_error = None;
    for file in files {
      if let Err(e) = lock(&file).sync() {
        first_error.get_or_insert(e);
      }
    }
    lock(&self.absent).clear();
    first_error.map_or(Ok(()), Err)
  }
}
