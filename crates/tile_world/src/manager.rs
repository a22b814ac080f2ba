//! Tile manager: the authoritative owner of every resident tile.
//!
//! All holder state lives here and is only mutated from the thread calling
//! [`TileManager::tick`]. Workers hand results back through a completion
//! channel that the tick drains. Tickets may be added from any thread through
//! the shared [`TicketRegistry`]; they take effect on the next tick.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use bevy::log::{debug, error, info, warn};
use web_time::Instant;

use crate::config::TileWorldConfig;
use crate::content::{DirtyChannels, TileContent};
use crate::coords::TilePos;
use crate::error::{FatalError, FaultSlot, IoError, OpenError, RequestError, TicketError};
use crate::executor::{PrioritisedExecutor, Priority, RayonExecutor, TaskQueue};
use crate::generator::StageGenerator;
use crate::holder::{HolderState, TileHolder, UnloadBlocker};
use crate::io::IoControllers;
use crate::propagator::{LevelPropagator, PlanarGraph};
use crate::scheduler::{Completion, MainTask};
use crate::status::{self, ContentStatus, FullStatus};
use crate::storage::{Channel, MemoryStorage, RegionStorage};
use crate::ticket::{TicketKind, TicketOwner, TicketRegistry};

/// Saves between backpressure waits in [`TileManager::save_all`].
const SAVES_PER_BACKPRESSURE: usize = 50;

/// Interval between `save_all` progress reports.
const SAVE_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// A tile's full status changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FullStatusChange {
  pub pos: TilePos,
  pub old: FullStatus,
  pub new: FullStatus,
}

/// Outcome of [`TileManager::save_all`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveStats {
  /// Holders whose dirty channels were handed to I/O.
  pub saved: usize,
  /// Holders that could not be serialized or queued.
  pub failed: usize,
  /// Writes still failing after the flush.
  pub unflushed: Vec<(Channel, TilePos)>,
}

/// Owns tile holders, tickets, levels and the I/O controllers.
pub struct TileManager {
  pub(crate) config: TileWorldConfig,
  pub(crate) tickets: Arc<TicketRegistry>,
  pub(crate) levels: LevelPropagator<PlanarGraph>,
  pub(crate) holders: HashMap<TilePos, TileHolder>,
  pub(crate) io: Arc<IoControllers>,
  pub(crate) worker: Arc<RayonExecutor>,
  pub(crate) main_queue: TaskQueue<MainTask>,
  pub(crate) completion_tx: Sender<Completion>,
  pub(crate) completion_rx: Receiver<Completion>,
  pub(crate) generator: Arc<dyn StageGenerator>,
  pub(crate) current_tick: u64,
  pub(crate) unload_queue: VecDeque<TilePos>,
  /// Autosave entries keyed by due tick.
  pub(crate) autosave: BTreeSet<(u64, TilePos)>,
  pub(crate) full_status_changes: Vec<FullStatusChange>,
  pub(crate) faults: FaultSlot,
  pub(crate) closing: bool,
  pub(crate) closed: bool,
  pub(crate) wait_depth: u32,
  /// Holders whose first stage failure is retried on the next pass.
  pub(crate) retry_list: Vec<TilePos>,
  pub(crate) next_task_id: u64,
  /// Read completions still due for cancelled loads, by task id.
  pub(crate) stray_reads: HashMap<u64, usize>,
}

impl TileManager {
  /// Opens a tile world persisted under `save_dir`.
  pub fn open(
    config: TileWorldConfig,
    save_dir: &Path,
    generator: Arc<dyn StageGenerator>,
  ) -> Result<Self, OpenError> {
    let faults = FaultSlot::default();
    let worker = Arc::new(RayonExecutor::new(
      "tile-worker",
      config.resolved_worker_threads(),
    )?);
    let io = IoControllers::open_dir(
      save_dir,
      config.group_shift,
      Arc::clone(&worker) as Arc<dyn PrioritisedExecutor>,
      config.io_threads,
      faults.clone(),
    )?;
    Ok(Self::assemble(config, io, worker, generator, faults))
  }

  /// Builds a manager over caller-provided storages, indexed by
  /// [`Channel::index`].
  pub fn with_storage(
    config: TileWorldConfig,
    storages: [Arc<dyn RegionStorage>; 3],
    generator: Arc<dyn StageGenerator>,
  ) -> Result<Self, OpenError> {
    let faults = FaultSlot::default();
    let worker = Arc::new(RayonExecutor::new(
      "tile-worker",
      config.resolved_worker_threads(),
    )?);
    let io = IoControllers::new(
      storages,
      Arc::clone(&worker) as Arc<dyn PrioritisedExecutor>,
      config.io_threads,
      faults.clone(),
    )?;
    Ok(Self::assemble(config, io, worker, generator, faults))
  }

  /// A world that keeps every channel in memory.
  pub fn in_memory(
    config: TileWorldConfig,
    generator: Arc<dyn StageGenerator>,
  ) -> Result<Self, OpenError> {
    let shift = config.group_shift;
    let storage = || -> Arc<dyn RegionStorage> { Arc::new(MemoryStorage::new(shift)) };
    Self::with_storage(config, [storage(), storage(), storage()], generator)
  }

  fn assemble(
    config: TileWorldConfig,
    io: IoControllers,
    worker: Arc<RayonExecutor>,
    generator: Arc<dyn StageGenerator>,
    faults: FaultSlot,
  ) -> Self {
    let (completion_tx, completion_rx) = async_channel::unbounded();
    Self {
      config,
      tickets: Arc::new(TicketRegistry::new()),
      levels: LevelPropagator::new(PlanarGraph::chebyshev(), status::unloaded_level()),
      holders: HashMap::new(),
      io: Arc::new(io),
      worker,
      main_queue: TaskQueue::new(),
      completion_tx,
      completion_rx,
      generator,
      current_tick: 0,
      unload_queue: VecDeque::new(),
      autosave: BTreeSet::new(),
      full_status_changes: Vec::new(),
      faults,
      closing: false,
      closed: false,
      wait_depth: 0,
      retry_list: Vec::new(),
      next_task_id: 0,
      stray_reads: HashMap::new(),
    }
  }

  pub fn config(&self) -> &TileWorldConfig {
    &self.config
  }

  /// Shared ticket registry; safe to use from any thread.
  pub fn tickets(&self) -> &Arc<TicketRegistry> {
    &self.tickets
  }

  pub fn io(&self) -> &Arc<IoControllers> {
    &self.io
  }

  pub fn current_tick(&self) -> u64 {
    self.current_tick
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }

  fn check_faults(&self) -> Result<(), FatalError> {
    match self.faults.get() {
      Some(fault) => Err(fault),
      None => Ok(()),
    }
  }

  /// Advances the world by one tick.
  ///
  /// Applies ticket changes, drains completed work, runs main-thread tasks,
  /// autosaves and unloads. Returns the first fatal error raised anywhere in
  /// the system; the caller must stop ticking.
  #[cfg_attr(feature = "tracy", tracing::instrument(skip_all))]
  pub fn tick(&mut self) -> Result<(), FatalError> {
    self.check_faults()?;
    if self.closed {
      return Ok(());
    }
    self.current_tick += 1;
    self.tickets.advance(self.current_tick);
    self.process_ticket_updates();
    self.retry_failed_stages();
    self.drain_completions();
    self.run_main_tasks();
    self.drain_completions();
    self.process_autosaves();
    self.process_unloads();
    if self.current_tick % self.config.write_retry_interval() == 0 {
      self.io.retry_failed_writes();
    }
    self.check_faults()
  }

  // Tickets

  /// Adds a keep-alive interest token. Applied on the next tick.
  pub fn add_interest_token(
    &self,
    pos: TilePos,
    level: u8,
    owner: TicketOwner,
  ) -> Result<bool, TicketError> {
    self.tickets.add(pos, TicketKind::Forced, level, owner, None)
  }

  /// Removes a token added with [`add_interest_token`](Self::add_interest_token).
  pub fn remove_interest_token(&self, pos: TilePos, level: u8, owner: TicketOwner) -> bool {
    self.tickets.remove(pos, TicketKind::Forced, level, owner)
  }

  pub fn add_ticket(
    &self,
    pos: TilePos,
    kind: TicketKind,
    level: u8,
    owner: TicketOwner,
    timeout_ticks: Option<u64>,
  ) -> Result<bool, TicketError> {
    self.tickets.add(pos, kind, level, owner, timeout_ticks)
  }

  pub fn remove_ticket(&self, pos: TilePos, kind: TicketKind, level: u8, owner: TicketOwner) -> bool {
    self.tickets.remove(pos, kind, level, owner)
  }

  pub fn remove_all_tickets_for(&self, kind: TicketKind, owner: TicketOwner) -> usize {
    self.tickets.remove_all_for(kind, owner)
  }

  pub fn remove_tickets_by_owner(&self, owner: TicketOwner) -> usize {
    self.tickets.remove_by_owner(owner)
  }

  /// Applies pending ticket changes to the level graph and reacts to every
  /// settled level change. Returns true if any level changed.
  pub fn process_ticket_updates(&mut self) -> bool {
    for (pos, level) in self.tickets.take_dirty() {
      self.levels.set_source(pos, level);
    }
    let deltas = self.levels.propagate_updates();
    for delta in &deltas {
      self.on_level_change(delta.node, delta.new);
    }
    !deltas.is_empty()
  }

  fn on_level_change(&mut self, pos: TilePos, level: u8) {
    let loaded = level <= status::max_loaded_level();
    match self.holders.get_mut(&pos) {
      Some(holder) => holder.level = level,
      None if loaded => {
        self
          .holders
          .insert(pos, TileHolder::new(pos, level, self.current_tick));
      }
      None => return,
    }
    self.update_full_status(pos);
    self.refresh(pos);
    if !loaded {
      self.enqueue_unload(pos);
    }
  }

  // Full status

  fn compute_full_status(&self, pos: TilePos) -> FullStatus {
    let Some(holder) = self.holders.get(&pos) else {
      return FullStatus::Inaccessible;
    };
    let cap = FullStatus::for_level(holder.level);
    if cap == FullStatus::Inaccessible || holder.current() != Some(ContentStatus::Full) {
      return FullStatus::Inaccessible;
    }
    let is_full = |n: TilePos| {
      self
        .holders
        .get(&n)
        .is_some_and(|h| h.current() == Some(ContentStatus::Full))
    };
    let mut status = FullStatus::Full;
    for candidate in [FullStatus::BlockTicking, FullStatus::EntityTicking] {
      if candidate > cap || !pos.neighbours_within(candidate.required_radius()).all(is_full) {
        break;
      }
      status = candidate;
    }
    status
  }

  pub(crate) fn update_full_status(&mut self, pos: TilePos) {
    let new = self.compute_full_status(pos);
    let Some(holder) = self.holders.get_mut(&pos) else {
      return;
    };
    let old = holder.full_status;
    if old == new {
      return;
    }
    holder.full_status = new;
    self.full_status_changes.push(FullStatusChange { pos, old, new });
    if new == FullStatus::Inaccessible {
      self.enqueue_unload(pos);
    }
  }

  /// Recomputes the full status of every tile whose status can depend on
  /// `pos`.
  pub(crate) fn refresh_full_status_around(&mut self, pos: TilePos) {
    for n in pos.square(FullStatus::EntityTicking.required_radius()) {
      self.update_full_status(n);
    }
  }

  /// Takes the full status changes recorded since the last call.
  pub fn drain_full_status_changes(&mut self) -> Vec<FullStatusChange> {
    std::mem::take(&mut self.full_status_changes)
  }

  // Unloading

  pub(crate) fn enqueue_unload(&mut self, pos: TilePos) {
    if let Some(holder) = self.holders.get_mut(&pos)
      && !holder.unload_queued
      && !holder.is_loaded_level()
    {
      holder.unload_queued = true;
      self.unload_queue.push_back(pos);
    }
  }

  #[cfg_attr(feature = "tracy", tracing::instrument(skip_all))]
  fn process_unloads(&mut self) {
    let budget = self.config.unload_budget(self.unload_queue.len());
    for _ in 0..budget {
      let Some(pos) = self.unload_queue.pop_front() else {
        break;
      };
      let Some(holder) = self.holders.get_mut(&pos) else {
        continue;
      };
      match holder.unload_blocker() {
        Some(UnloadBlocker::TicketLevel) => {
          holder.unload_queued = false;
          continue;
        }
        Some(_) => {
          self.unload_queue.push_back(pos);
          continue;
        }
        None => {}
      }

      if let Err(e) = self.save_holder(pos, Priority::Low) {
        error!("Failed to save tile {pos} before unloading: {e}");
        if let Some(holder) = self.holders.get_mut(&pos) {
          holder.unload_queued = false;
        }
        let cooldown = self.tickets.add(
          pos,
          TicketKind::UnloadCooldown,
          status::max_loaded_level(),
          TicketOwner::default(),
          Some(self.config.unload_cooldown_ticks),
        );
        if let Err(e) = cooldown {
          warn!("Could not keep tile {pos} after failed save: {e}");
        }
        continue;
      }
      self.remove_holder(pos);
      debug!("Unloaded tile {pos}");
    }
  }

  fn remove_holder(&mut self, pos: TilePos) {
    if self.holders.remove(&pos).is_some() {
      self.refresh_full_status_around(pos);
    }
  }

  // Saving

  /// Hands the dirty channels of one holder to the I/O controllers.
  /// Returns false when there was nothing to save.
  pub(crate) fn save_holder(&mut self, pos: TilePos, priority: Priority) -> Result<bool, IoError> {
    let Some(holder) = self.holders.get_mut(&pos) else {
      return Ok(false);
    };
    let Some(content) = holder.content.as_mut() else {
      return Ok(false);
    };
    let dirty = content.dirty();
    if dirty.is_empty() {
      return Ok(false);
    }
    for channel in dirty.channels() {
      self
        .io
        .write(channel, pos, Some(content.encode(channel)), priority)?;
      Arc::make_mut(content).mark_clean(DirtyChannels::for_channel(channel));
    }
    holder.last_save_tick = self.current_tick;
    Ok(true)
  }

  pub(crate) fn schedule_autosave(&mut self, pos: TilePos) {
    let due = self.current_tick + self.config.autosave_interval_ticks.max(1);
    if let Some(holder) = self.holders.get_mut(&pos)
      && holder.autosave_due.is_none()
    {
      holder.autosave_due = Some(due);
      self.autosave.insert((due, pos));
    }
  }

  fn process_autosaves(&mut self) {
    let interval = self.config.autosave_interval_ticks.max(1);
    let mut saved = 0;
    while saved < self.config.max_autosaves_per_tick {
      let Some(&(due, pos)) = self.autosave.first() else {
        break;
      };
      if due > self.current_tick {
        break;
      }
      self.autosave.pop_first();
      let Some(holder) = self.holders.get_mut(&pos) else {
        continue;
      };
      if holder.autosave_due != Some(due) {
        continue;
      }
      let next = self.current_tick + interval;
      holder.autosave_due = Some(next);
      self.autosave.insert((next, pos));
      match self.save_holder(pos, Priority::Low) {
        Ok(true) => saved += 1,
        Ok(false) => {}
        Err(e) => error!("Autosave failed for tile {pos}: {e}"),
      }
    }
  }

  /// Saves every dirty holder, optionally flushing all channels afterwards.
  ///
  /// Per-holder failures are logged and counted; they never stop the pass.
  #[cfg_attr(feature = "tracy", tracing::instrument(skip_all))]
  pub fn save_all(&mut self, flush: bool) -> SaveStats {
    let started = Instant::now();
    let mut last_report = started;
    let mut stats = SaveStats::default();
    let mut positions: Vec<TilePos> = self.holders.keys().copied().collect();
    positions.sort();

    for pos in positions {
      match self.save_holder(pos, Priority::Normal) {
        Ok(true) => {
          stats.saved += 1;
          if stats.saved % SAVES_PER_BACKPRESSURE == 0 {
            self
              .io
              .wait_for_in_flight_below(self.config.flush_backpressure);
          }
        }
        Ok(false) => {}
        Err(e) => {
          stats.failed += 1;
          error!("Failed to save tile {pos}: {e}");
        }
      }
      if last_report.elapsed() >= SAVE_PROGRESS_INTERVAL {
        info!("Saving tiles: {} saved, {} failed", stats.saved, stats.failed);
        last_report = Instant::now();
      }
    }

    if flush {
      stats.unflushed = self.io.flush();
      for (channel, pos) in &stats.unflushed {
        error!("Unflushed {channel} data for tile {pos}");
      }
    }
    debug!(
      "Saved {} tiles in {:.1?} ({} failed)",
      stats.saved,
      started.elapsed(),
      stats.failed
    );
    stats
  }

  /// Shuts the world down.
  ///
  /// Rejects new tickets, lets in-flight work finish, optionally saves
  /// every holder, destroys all holders and closes the I/O controllers.
  /// Errors along the way are logged and never stop the sequence; dropped
  /// writes are reported as [`FatalError::ShutdownFlush`] at the end.
  #[cfg_attr(feature = "tracy", tracing::instrument(skip_all))]
  pub fn close(&mut self, save: bool) -> Result<(), FatalError> {
    if self.closed {
      return Ok(());
    }
    info!("Closing tile world with {} resident tiles", self.holders.len());
    self.closing = true;
    self.tickets.close();
    self.process_ticket_updates();

    let positions: Vec<TilePos> = self.holders.keys().copied().collect();
    for pos in &positions {
      self.cancel_queued_task(*pos);
    }
    let drained =
      self.run_pending_work_while_waiting(|m| m.holders.values().all(|h| h.task.is_none()));
    if !drained {
      error!("Tile tasks still running at shutdown");
    }
    let cancelled = self.main_queue.cancel_all();
    if cancelled > 0 {
      debug!("Dropped {cancelled} main-thread tasks at shutdown");
    }

    for holder in self.holders.values_mut() {
      for waiter in holder.status_waiters.drain(..) {
        let _ = waiter.tx.try_send(Err(RequestError::Closed));
      }
    }

    let mut failures = Vec::new();
    if save {
      let stats = self.save_all(true);
      if stats.failed > 0 {
        error!("{} tiles could not be saved at shutdown", stats.failed);
      }
    }

    for holder in self.holders.values() {
      if holder.full_status != FullStatus::Inaccessible {
        self.full_status_changes.push(FullStatusChange {
          pos: holder.pos,
          old: holder.full_status,
          new: FullStatus::Inaccessible,
        });
      }
    }
    self.holders.clear();
    self.unload_queue.clear();
    self.autosave.clear();
    self.retry_list.clear();
    self.stray_reads.clear();

    failures.extend(self.io.close());
    self.closed = true;
    info!("Tile world closed");

    if let Some(fault) = self.faults.take() {
      error!("Tile world closed after a fatal error: {fault}");
    }
    if failures.is_empty() {
      Ok(())
    } else {
      Err(FatalError::ShutdownFlush { failures })
    }
  }

  // Access

  /// Applies `f` to resident content, copy-on-write.
  ///
  /// Returns None if the tile has no content or a stage is running on it.
  /// Changes are marked dirty and persisted by the next save.
  pub fn modify<R>(&mut self, pos: TilePos, f: impl FnOnce(&mut TileContent) -> R) -> Option<R> {
    let holder = self.holders.get_mut(&pos)?;
    if holder.task.is_some() {
      return None;
    }
    let content = holder.content.as_mut()?;
    Some(f(Arc::make_mut(content)))
  }

  pub fn holder(&self, pos: TilePos) -> Option<&TileHolder> {
    self.holders.get(&pos)
  }

  pub fn holder_count(&self) -> usize {
    self.holders.len()
  }

  pub fn resident(&self) -> impl Iterator<Item = TilePos> + '_ {
    self.holders.keys().copied()
  }

  /// Highest status reached by a resident tile.
  pub fn status(&self, pos: TilePos) -> Option<ContentStatus> {
    self.holders.get(&pos).and_then(TileHolder::current)
  }

  /// Propagated ticket level at `pos`.
  pub fn level(&self, pos: TilePos) -> u8 {
    self.levels.level(pos)
  }

  pub fn full_status(&self, pos: TilePos) -> FullStatus {
    self
      .holders
      .get(&pos)
      .map_or(FullStatus::Inaccessible, |h| h.full_status)
  }

  pub fn holder_state(&self, pos: TilePos) -> HolderState {
    self
      .holders
      .get(&pos)
      .map_or(HolderState::Unloaded, TileHolder::state)
  }

  /// Ok if the holder could be destroyed now, otherwise the first reason it
  /// must stay.
  pub fn is_safe_to_unload(&self, pos: TilePos) -> Result<(), UnloadBlocker> {
    match self.holders.get(&pos).and_then(TileHolder::unload_blocker) {
      Some(blocker) => Err(blocker),
      None => Ok(()),
    }
  }

  /// Stage and load tasks in flight across all holders.
  pub fn tasks_in_flight(&self) -> usize {
    self.holders.values().filter(|h| h.task.is_some()).count()
  }
}

impl Drop for TileManager {
  fn drop(&mut self) {
    if !self.closed
      && let Err(e) = self.close(true)
    {
      error!("Failed to close tile world on drop: {e}");
    }
  }
}
