//! In-memory storage with failure injection, for tests and tools.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::RegionStorage;
use crate::coords::{ContainerPos, TilePos};
use crate::error::StorageError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage backed by a hash map.
///
/// Records how often containers were accessed concurrently so tests can
/// check per-container serialization.
#[derive(Default)]
pub struct MemoryStorage {
  group_shift: u32,
  data: Mutex<HashMap<TilePos, Vec<u8>>>,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
  write_delay_micros: AtomicU64,
  read_delay_micros: AtomicU64,
  reads: AtomicUsize,
  writes: AtomicUsize,
  flushes: AtomicUsize,
  active: Mutex<HashSet<ContainerPos>>,
  overlaps: AtomicUsize,
  closed: AtomicBool,
}

struct ActiveGuard<'a> {
  storage: &'a MemoryStorage,
  container: ContainerPos,
}

impl Drop for ActiveGuard<'_> {
  fn drop(&mut self) {
    lock(&self.storage.active).remove(&self.container);
  }
}

impl MemoryStorage {
  pub fn new(group_shift: u32) -> Self {
    Self {
      group_shift,
      ..Default::default()
    }
  }

  /// Makes every read fail until reset.
  pub fn set_fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::Release);
  }

  /// Makes every write fail until reset.
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::Release);
  }

  /// Sleeps inside every write, widening race windows.
  pub fn set_write_delay(&self, delay: Duration) {
    self
      .write_delay_micros
      .store(delay.as_micros() as u64, Ordering::Release);
  }

  /// Sleeps inside every read.
  pub fn set_read_delay(&self, delay: Duration) {
    self
      .read_delay_micros
      .store(delay.as_micros() as u64, Ordering::Release);
  }

  /// Stored payload, bypassing failure injection.
  pub fn get(&self, pos: TilePos) -> Option<Vec<u8>> {
    lock(&self.data).get(&pos).cloned()
  }

  /// Number of stored tiles.
  pub fn len(&self) -> usize {
    lock(&self.data).len()
  }

  pub fn is_empty(&self) -> bool {
    lock(&self.data).is_empty()
  }

  pub fn read_count(&self) -> usize {
    self.reads.load(Ordering::Acquire)
  }

  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::Acquire)
  }

  pub fn flush_count(&self) -> usize {
    self.flushes.load(Ordering::Acquire)
  }

  /// Times a container was entered while another call held it.
  pub fn overlap_count(&self) -> usize {
    self.overlaps.load(Ordering::Acquire)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  fn enter(&self, pos: TilePos) -> Result<ActiveGuard<'_>, StorageError> {
    if self.is_closed() {
      return Err(StorageError::Closed);
    }
    let container = self.container_of(pos);
    if !lock(&self.active).insert(container) {
      self.overlaps.fetch_add(1, Ordering::AcqRel);
    }
    Ok(ActiveGuard {
      storage: self,
      container,
    })
  }
}

impl RegionStorage for MemoryStorage {
  fn group_shift(&self) -> u32 {
    self.group_shift
  }

  fn exists(&self, pos: TilePos) -> bool {
    lock(&self.data).contains_key(&pos)
  }

  fn read_raw(&self, pos: TilePos) -> Result<Option<Vec<u8>>, StorageError> {
    let _active = self.enter(pos)?;
    self.reads.fetch_add(1, Ordering::AcqRel);
    let delay = self.read_delay_micros.load(Ordering::Acquire);
    if delay > 0 {
      std::thread::sleep(Duration::from_micros(delay));
    }
    if self.fail_reads.load(Ordering::Acquire) {
      return Err(io::Error::other("injected read failure").into());
    }
    Ok(self.get(pos))
  }

  fn write_raw(&self, pos: TilePos, data: Option<&[u8]>) -> Result<(), StorageError> {
    let _active = self.enter(pos)?;
    let delay = self.write_delay_micros.load(Ordering::Acquire);
    if delay > 0 {
      std::thread::sleep(Duration::from_micros(delay));
    }
    if self.fail_writes.load(Ordering::Acquire) {
      return Err(io::Error::other("injected write failure").into());
    }
    self.writes.fetch_add(1, Ordering::AcqRel);
    let mut stored = lock(&self.data);
    match data {
      Some(bytes) if !bytes.is_empty() => {
        stored.insert(pos, bytes.to_vec());
      }
      _ => {
        stored.remove(&pos);
      }
    }
    Ok(())
  }

  fn flush_container(&self, _container: ContainerPos) -> Result<(), StorageError> {
    self.flush()
  }

  fn flush(&self) -> Result<(), StorageError> {
    if self.is_closed() {
      return Err(StorageError::Closed);
    }
    self.flushes.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }

  fn close(&self) -> Result<(), StorageError> {
    self.closed.store(true, Ordering::Release);
    Ok(())
  }
}
