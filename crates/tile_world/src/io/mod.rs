//! Asynchronous storage I/O.
//!
//! One [`IoController`] per [`Channel`], grouped in [`IoControllers`]. Storage
//! jobs run on a dedicated I/O pool; compression shares the stage worker pool.

mod container;
mod controller;

use std::path::Path;
use std::sync::Arc;

use bevy::log::info;
pub use controller::{IoController, IoPhase, Payload, ReadCallback, ReadHandle, ReadResult};

use crate::coords::TilePos;
use crate::error::{FaultSlot, IoError, OpenError};
use crate::executor::{Backoff, PrioritisedExecutor, Priority, RayonExecutor};
use crate::storage::{Channel, RegionFileStorage, RegionStorage};

/// The tiles, index and entities controllers.
pub struct IoControllers {
  controllers: [Arc<IoController>; 3],
  io: Arc<RayonExecutor>,
}

impl IoControllers {
  /// Builds controllers over the given storages, indexed by
  /// [`Channel::index`].
  pub fn new(
    storages: [Arc<dyn RegionStorage>; 3],
    compute: Arc<dyn PrioritisedExecutor>,
    io_threads: usize,
    faults: FaultSlot,
  ) -> Result<Self, OpenError> {
    let io = Arc::new(RayonExecutor::new("tile-io", io_threads)?);
    let [tiles, index, entities] = storages;
    let make = |channel: Channel, storage: Arc<dyn RegionStorage>| {
      IoController::new(
        channel,
        storage,
        Arc::clone(&compute),
        Arc::clone(&io) as Arc<dyn PrioritisedExecutor>,
        faults.clone(),
      )
    };
    Ok(Self {
      controllers: [
        make(Channel::Tiles, tiles),
        make(Channel::Index, index),
        make(Channel::Entities, entities),
      ],
      io,
    })
  }

  /// Region file storages under `dir`, one subdirectory per channel.
  pub fn open_dir(
    dir: &Path,
    group_shift: u32,
    compute: Arc<dyn PrioritisedExecutor>,
    io_threads: usize,
    faults: FaultSlot,
  ) -> Result<Self, OpenError> {
    let open = |channel: Channel| -> Result<Arc<dyn RegionStorage>, OpenError> {
      Ok(Arc::new(RegionFileStorage::open(
        dir.join(channel.name()),
        group_shift,
      )?))
    };
    let storages = [
      open(Channel::Tiles)?,
      open(Channel::Index)?,
      open(Channel::Entities)?,
    ];
    info!("Opened tile storage at {}", dir.display());
    Self::new(storages, compute, io_threads, faults)
  }

  pub fn get(&self, channel: Channel) -> &Arc<IoController> {
    &self.controllers[channel.index()]
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<IoController>> {
    self.controllers.iter()
  }

  pub fn read(
    &self,
    channel: Channel,
    pos: TilePos,
    priority: Priority,
    callback: ReadCallback,
  ) -> ReadHandle {
    self.get(channel).read(pos, priority, callback)
  }

  pub fn write(
    &self,
    channel: Channel,
    pos: TilePos,
    payload: Option<Vec<u8>>,
    priority: Priority,
  ) -> Result<(), IoError> {
    self.get(channel).write(pos, payload, priority)
  }

  /// Raises queued work for `pos` on every channel.
  pub fn raise_priority(&self, pos: TilePos, priority: Priority) {
    for controller in &self.controllers {
      controller.raise_priority(pos, priority);
    }
  }

  /// Tracked tasks across channels.
  pub fn outstanding(&self) -> usize {
    self.controllers.iter().map(|c| c.outstanding()).sum()
  }

  /// Reads and writes in progress across channels.
  pub fn in_flight(&self) -> usize {
    self.controllers.iter().map(|c| c.in_flight()).sum()
  }

  /// Backpressure: spins until fewer than `limit` operations are in flight.
  pub fn wait_for_in_flight_below(&self, limit: usize) {
    let mut backoff = Backoff::new();
    while self.in_flight() >= limit.max(1) {
      backoff.snooze();
    }
  }

  pub fn retry_failed_writes(&self) -> usize {
    self
      .controllers
      .iter()
      .map(|c| c.retry_failed_writes())
      .sum()
  }

  /// Flushes every channel; returns writes that still failed.
  pub fn flush(&self) -> Vec<(Channel, TilePos)> {
    self
      .controllers
      .iter()
      .flat_map(|c| {
        let channel = c.channel();
        c.flush().into_iter().map(move |pos| (channel, pos))
      })
      .collect()
  }

  /// Closes every channel; returns writes that were dropped.
  pub fn close(&self) -> Vec<(Channel, TilePos)> {
    let dropped = self
      .controllers
      .iter()
      .flat_map(|c| {
        let channel = c.channel();
        c.close().into_iter().map(move |pos| (channel, pos))
      })
      .collect();
    let mut backoff = Backoff::new();
    while self.io.outstanding() > 0 {
      backoff.snooze();
    }
    dropped
  }

  /// Blocks until a read completes. For tools and tests; the tile manager
  /// never blocks on reads.
  pub fn read_blocking(&self, channel: Channel, pos: TilePos) -> ReadResult {
    let (tx, rx) = async_channel::bounded(1);
    self.read(
      channel,
      pos,
      Priority::Blocking,
      Box::new(move |result| {
        let _ = tx.send_blocking(result);
      }),
    );
    rx.recv_blocking()
      .unwrap_or(Err(IoError::Shutdown { channel }))
  }
}
