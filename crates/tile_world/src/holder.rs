//! Per-tile state owned by the tile manager.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_channel::Sender;

use crate::content::TileContent;
use crate::coords::TilePos;
use crate::error::{RequestError, StageError};
use crate::executor::{Priority, TaskHandle};
use crate::io::{ReadHandle, ReadResult};
use crate::status::{self, ContentStatus, FullStatus};
use crate::storage::Channel;
use crate::ticket::TicketOwner;

/// Lifecycle state of a holder, derived from its fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HolderState {
  /// No content and nothing in flight.
  Unloaded,
  /// Reading persisted channels.
  Loading,
  /// Content at a generation status, not ticking.
  Status(ContentStatus),
  /// Full and allowed to tick blocks.
  Ticking,
  /// Full and allowed to tick entities.
  EntityTicking,
  /// Waiting in the unload queue.
  Unloading,
}

/// First reason a holder cannot be destroyed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnloadBlocker {
  /// Ticket level still keeps the tile loaded.
  TicketLevel,
  /// Neighbour stages are reading this tile's content.
  NeighboursUsing,
  /// Neighbours wait for this tile to reach a status.
  NeighboursWaiting,
  /// A stage or load is in flight.
  Generating,
  /// Generation was requested and is waiting on dependencies.
  RequestedGeneration,
  /// Status requests are pending.
  StatusWaiters,
  /// The tile is still visible or ticking.
  FullStatus,
}

impl fmt::Display for UnloadBlocker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      Self::TicketLevel => "ticket level",
      Self::NeighboursUsing => "neighbours using content",
      Self::NeighboursWaiting => "neighbours waiting",
      Self::Generating => "generating",
      Self::RequestedGeneration => "generation requested",
      Self::StatusWaiters => "status waiters",
      Self::FullStatus => "full status",
    };
    f.write_str(text)
  }
}

pub(crate) enum StageTaskKind {
  /// Parallel stage on the worker pool.
  Worker(TaskHandle),
  /// Serial stage on the main queue.
  Main(TaskHandle),
  /// Reads of every channel, results collected by channel index.
  Load {
    reads: Vec<ReadHandle>,
    results: [Option<ReadResult>; 3],
  },
}

/// Work in flight for a holder.
pub(crate) struct StageTask {
  pub id: u64,
  pub status: ContentStatus,
  pub kind: StageTaskKind,
  /// Neighbours whose `neighbours_using` count this task holds.
  pub footprint: Vec<TilePos>,
}

impl StageTask {
  pub fn set_priority(&self, priority: Priority) {
    match &self.kind {
      StageTaskKind::Worker(handle) | StageTaskKind::Main(handle) => handle.set_priority(priority),
      StageTaskKind::Load { .. } => {}
    }
  }

  /// Cancels work that has not started.
  ///
  /// Returns how many completions may still arrive for the task, or None if
  /// it already started. A load withdraws every outstanding read; reads whose
  /// callbacks already fired still deliver.
  pub fn cancel(&self) -> Option<usize> {
    match &self.kind {
      StageTaskKind::Worker(handle) | StageTaskKind::Main(handle) => handle.cancel().then_some(0),
      StageTaskKind::Load { reads, results } => Some(
        reads
          .iter()
          .filter(|read| results[read.channel().index()].is_none() && !read.cancel())
          .count(),
      ),
    }
  }

  /// Stores a channel read result; returns true once every channel arrived.
  pub fn record_read(&mut self, channel: Channel, result: ReadResult) -> bool {
    match &mut self.kind {
      StageTaskKind::Load { results, .. } => {
        results[channel.index()] = Some(result);
        results.iter().all(Option::is_some)
      }
      _ => false,
    }
  }
}

pub(crate) type RequestSender = Sender<Result<Arc<TileContent>, RequestError>>;

/// A pending `request_status` caller.
pub(crate) struct StatusWaiter {
  pub status: ContentStatus,
  pub owner: TicketOwner,
  pub level: u8,
  pub tx: RequestSender,
}

/// Authoritative state of one resident tile.
pub struct TileHolder {
  pub(crate) pos: TilePos,
  pub(crate) level: u8,
  pub(crate) content: Option<Arc<TileContent>>,
  /// Highest status generation was asked to reach.
  pub(crate) requested: Option<ContentStatus>,
  pub(crate) task: Option<StageTask>,
  /// Neighbours this tile waits on before its next stage.
  pub(crate) blocking: HashSet<TilePos>,
  /// Neighbours waiting on this tile, with the status each needs.
  pub(crate) waiting_for_us: HashMap<TilePos, ContentStatus>,
  pub(crate) neighbours_using: u32,
  pub(crate) status_waiters: Vec<StatusWaiter>,
  pub(crate) full_status: FullStatus,
  pub(crate) priority: Priority,
  pub(crate) failures: u32,
  /// Status that failed; generation stops below it.
  pub(crate) failed_at: Option<ContentStatus>,
  pub(crate) last_error: Option<StageError>,
  pub(crate) last_save_tick: u64,
  /// Tick of this holder's live autosave queue entry.
  pub(crate) autosave_due: Option<u64>,
  pub(crate) unload_queued: bool,
}

impl TileHolder {
  pub(crate) fn new(pos: TilePos, level: u8, tick: u64) -> Self {
    Self {
      pos,
      level,
      content: None,
      requested: None,
      task: None,
      blocking: HashSet::new(),
      waiting_for_us: HashMap::new(),
      neighbours_using: 0,
      status_waiters: Vec::new(),
      full_status: FullStatus::Inaccessible,
      priority: Priority::Normal,
      failures: 0,
      failed_at: None,
      last_error: None,
      last_save_tick: tick,
      autosave_due: None,
      unload_queued: false,
    }
  }

  pub fn pos(&self) -> TilePos {
    self.pos
  }

  pub fn level(&self) -> u8 {
    self.level
  }

  pub fn content(&self) -> Option<&Arc<TileContent>> {
    self.content.as_ref()
  }

  /// Highest status reached so far.
  pub fn current(&self) -> Option<ContentStatus> {
    self.content.as_ref().map(|c| c.status())
  }

  pub fn full_status(&self) -> FullStatus {
    self.full_status
  }

  pub fn priority(&self) -> Priority {
    self.priority
  }

  pub fn is_loaded_level(&self) -> bool {
    self.level <= status::max_loaded_level()
  }

  /// Returns true once generation gave up on `status`.
  pub fn has_failed(&self, status: ContentStatus) -> bool {
    self.failures >= 2 && self.failed_at.is_some_and(|f| f <= status)
  }

  /// Error from the most recent failed stage or load.
  pub fn last_error(&self) -> Option<&StageError> {
    self.last_error.as_ref()
  }

  pub fn last_save_tick(&self) -> u64 {
    self.last_save_tick
  }

  /// Status the holder should be driven to: the level's status, raised by
  /// waiting neighbours and status requests, capped below a failed stage.
  pub(crate) fn target(&self) -> Option<ContentStatus> {
    let mut target = status::status_for_level(self.level);
    for required in self.waiting_for_us.values() {
      target = target.max(Some(*required));
    }
    for waiter in &self.status_waiters {
      target = target.max(Some(waiter.status));
    }
    match self.failed_at {
      Some(failed) => target.filter(|t| *t < failed).or_else(|| {
        // Keep what already exists below the failed stage.
        failed.prev().filter(|_| target.is_some())
      }),
      None => target,
    }
  }

  pub fn state(&self) -> HolderState {
    if self.unload_queued {
      return HolderState::Unloading;
    }
    match (self.current(), &self.task) {
      (None, Some(StageTask {
        kind: StageTaskKind::Load { .. },
        ..
      })) => HolderState::Loading,
      (None, _) => HolderState::Unloaded,
      (Some(_), _) if self.full_status == FullStatus::EntityTicking => HolderState::EntityTicking,
      (Some(_), _) if self.full_status == FullStatus::BlockTicking => HolderState::Ticking,
      (Some(status), _) => HolderState::Status(status),
    }
  }

  /// First reason this holder must stay resident, or None if it may be
  /// destroyed once saved.
  pub fn unload_blocker(&self) -> Option<UnloadBlocker> {
    if self.is_loaded_level() {
      Some(UnloadBlocker::TicketLevel)
    } else if self.neighbours_using > 0 {
      Some(UnloadBlocker::NeighboursUsing)
    } else if !self.waiting_for_us.is_empty() {
      Some(UnloadBlocker::NeighboursWaiting)
    } else if self.task.is_some() {
      Some(UnloadBlocker::Generating)
    } else if !self.blocking.is_empty() {
      Some(UnloadBlocker::RequestedGeneration)
    } else if !self.status_waiters.is_empty() {
      Some(UnloadBlocker::StatusWaiters)
    } else if self.full_status != FullStatus::Inaccessible {
      Some(UnloadBlocker::FullStatus)
    } else {
      None
    }
  }

  /// Returns true if content changed since the last save.
  pub fn is_dirty(&self) -> bool {
    self.content.as_ref().is_some_and(|c| c.is_dirty())
  }
}

impl fmt::Debug for TileHolder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TileHolder")
      .field("pos", &self.pos)
      .field("level", &self.level)
      .field("current", &self.current())
      .field("requested", &self.requested)
      .field("task", &self.task.as_ref().map(|t| (t.id, t.status)))
      .field("blocking", &self.blocking.len())
      .field("waiting_for_us", &self.waiting_for_us.len())
      .field("neighbours_using", &self.neighbours_using)
      .field("full_status", &self.full_status)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn holder(level: u8) -> TileHolder {
    TileHolder::new(TilePos::new(0, 0), level, 0)
  }

  #[test]
  fn target_follows_level_and_waiters() {
    let mut h = holder(status::FULL_LEVEL);
    assert_eq!(h.target(), Some(ContentStatus::Full));

    h.level = status::unloaded_level();
    assert_eq!(h.target(), None);
    h.waiting_for_us
      .insert(TilePos::new(1, 0), ContentStatus::Biomes);
    assert_eq!(h.target(), Some(ContentStatus::Biomes));
  }

  #[test]
  fn failed_stage_caps_target() {
    let mut h = holder(status::FULL_LEVEL);
    h.failed_at = Some(ContentStatus::Noise);
    assert_eq!(h.target(), Some(ContentStatus::Biomes));

    h.failed_at = Some(ContentStatus::Empty);
    assert_eq!(h.target(), None);
  }

  #[test]
  fn blockers_are_reported_in_order() {
    let mut h = holder(status::FULL_LEVEL);
    assert_eq!(h.unload_blocker(), Some(UnloadBlocker::TicketLevel));

    h.level = status::unloaded_level();
    h.neighbours_using = 1;
    h.waiting_for_us
      .insert(TilePos::new(0, 1), ContentStatus::Empty);
    assert_eq!(h.unload_blocker(), Some(UnloadBlocker::NeighboursUsing));

    h.neighbours_using = 0;
    assert_eq!(h.unload_blocker(), Some(UnloadBlocker::NeighboursWaiting));

    h.waiting_for_us.clear();
    h.full_status = FullStatus::Full;
    assert_eq!(h.unload_blocker(), Some(UnloadBlocker::FullStatus));

    h.full_status = FullStatus::Inaccessible;
    assert_eq!(h.unload_blocker(), None);
    assert_eq!(h.state(), HolderState::Unloaded);
  }
}
