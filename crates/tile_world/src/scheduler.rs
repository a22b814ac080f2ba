//! Dependency-driven stage scheduling.
//!
//! Driving a tile to a status walks the dependency pyramid one stage at a
//! time. Before a stage runs, every neighbour within the stage's radius must
//! have reached the status the stage reads from it; unmet neighbours are
//! scheduled recursively and record the waiting tile, which keeps them
//! resident until it is satisfied. Stage functions run on the worker pool
//! (or the main-thread queue for serial stages) against snapshots and return
//! their result through the completion channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_channel::{Receiver, TryRecvError};
use bevy::log::{debug, error};

use crate::content::TileContent;
use crate::coords::TilePos;
use crate::error::{FatalError, RequestError, StageError};
use crate::executor::{Backoff, PrioritisedExecutor, Priority, TaskHandle};
use crate::generator::{StageContext, run_stage};
use crate::holder::{StageTask, StageTaskKind, StatusWaiter, TileHolder};
use crate::io::{Payload, ReadResult};
use crate::manager::TileManager;
use crate::status::{self, ContentStatus};
use crate::storage::Channel;
use crate::ticket::{TicketKind, TicketOwner};

/// Nested `run_pending_work_while_waiting` calls allowed before the
/// manager treats the recursion as a fault.
const MAX_WAIT_DEPTH: u32 = 8;

/// Work queued for the authoritative thread.
pub type MainTask = Box<dyn FnOnce(&mut TileManager) + Send + 'static>;

/// Result sent back to the authoritative thread.
pub(crate) enum Completion {
  Stage {
    pos: TilePos,
    task_id: u64,
    status: ContentStatus,
    result: Result<TileContent, StageError>,
  },
  Load {
    pos: TilePos,
    task_id: u64,
    channel: Channel,
    result: ReadResult,
  },
}

/// Pending result of [`TileManager::request_status`].
pub struct StatusRequest {
  pos: TilePos,
  status: ContentStatus,
  owner: TicketOwner,
  rx: Receiver<Result<Arc<TileContent>, RequestError>>,
}

impl StatusRequest {
  pub fn pos(&self) -> TilePos {
    self.pos
  }

  pub fn status(&self) -> ContentStatus {
    self.status
  }

  /// Owner of the request ticket backing this request.
  pub fn owner(&self) -> TicketOwner {
    self.owner
  }

  /// Returns true once a result can be taken.
  pub fn is_ready(&self) -> bool {
    !self.rx.is_empty() || self.rx.is_closed()
  }

  /// Takes the result if it arrived. A request whose holder went away
  /// without answering reports [`RequestError::Cancelled`].
  pub fn try_take(&self) -> Option<Result<Arc<TileContent>, RequestError>> {
    match self.rx.try_recv() {
      Ok(result) => Some(result),
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Closed) => Some(Err(RequestError::Cancelled)),
    }
  }

  /// Waits for the result. Only completes while the manager keeps ticking.
  pub async fn wait(self) -> Result<Arc<TileContent>, RequestError> {
    self
      .rx
      .recv()
      .await
      .unwrap_or(Err(RequestError::Cancelled))
  }
}

fn payload(result: Option<ReadResult>) -> Result<Option<Payload>, StageError> {
  result.unwrap_or(Ok(None)).map_err(StageError::from)
}

/// Takes `task` out if it can still be cancelled and returns its footprint.
/// Reads a cancelled load can no longer withdraw are counted in `strays`.
fn withdraw_task(
  task: &mut Option<StageTask>,
  strays: &mut HashMap<u64, usize>,
) -> Option<Vec<TilePos>> {
  let pending = task.as_ref()?.cancel()?;
  let task = task.take()?;
  if pending > 0 {
    strays.insert(task.id, pending);
  }
  Some(task.footprint)
}

/// Decodes the three channel reads of a load. Absent tiles yield None.
fn decode_load(
  pos: TilePos,
  results: [Option<ReadResult>; 3],
) -> Result<Option<TileContent>, StageError> {
  let [tiles, index, entities] = results;
  let (tiles, index, entities) = (payload(tiles)?, payload(index)?, payload(entities)?);
  TileContent::decode(pos, tiles.as_deref(), index.as_deref(), entities.as_deref())
}

impl TileManager {
  fn allocate_task_id(&mut self) -> u64 {
    self.next_task_id += 1;
    self.next_task_id
  }

  fn task_fault(&self, what: &'static str, pos: TilePos, task_id: u64) {
    let found = self
      .holders
      .get(&pos)
      .and_then(|h| h.task.as_ref())
      .map_or_else(|| "none".to_string(), |t| t.id.to_string());
    self.faults.record(FatalError::invariant(
      what,
      vec![
        ("pos", pos.to_string()),
        ("expected task", task_id.to_string()),
        ("found task", found),
      ],
    ));
  }

  // Requests

  /// Asks for `pos` to reach `status`.
  ///
  /// Resolves immediately when the tile is already there. Otherwise a
  /// request ticket keeps the tile (and the neighbours its pyramid needs)
  /// resident until the result is delivered.
  pub fn request_status(
    &mut self,
    pos: TilePos,
    status: ContentStatus,
    priority: Priority,
  ) -> StatusRequest {
    self.submit_request(pos, status, priority, true)
  }

  /// Drives `pos` to `target` without a ticket of its own.
  ///
  /// The pending request alone keeps the holder resident; once answered
  /// the tile falls back to whatever its ticket level asks for.
  pub fn schedule_to_status(
    &mut self,
    pos: TilePos,
    target: ContentStatus,
    priority: Priority,
  ) -> StatusRequest {
    self.submit_request(pos, target, priority, false)
  }

  fn submit_request(
    &mut self,
    pos: TilePos,
    status: ContentStatus,
    priority: Priority,
    ticketed: bool,
  ) -> StatusRequest {
    let (tx, rx) = async_channel::bounded(1);
    let owner = self.tickets.allocate_owner();
    let request = StatusRequest {
      pos,
      status,
      owner,
      rx,
    };
    if self.closing {
      let _ = tx.try_send(Err(RequestError::Closed));
      return request;
    }
    if let Some(content) = self.get_if_resident(pos, status) {
      let _ = tx.try_send(Ok(content));
      return request;
    }

    let level = status::level_for_status(status);
    if ticketed {
      if let Err(e) = self
        .tickets
        .add(pos, TicketKind::Request, level, owner, None)
      {
        let _ = tx.try_send(Err(e.into()));
        return request;
      }
      self.process_ticket_updates();
    }

    if !self.holders.contains_key(&pos) {
      let holder = TileHolder::new(pos, self.levels.level(pos), self.current_tick);
      self.holders.insert(pos, holder);
      self.enqueue_unload(pos);
    }
    let Some(holder) = self.holders.get_mut(&pos) else {
      return request;
    };
    if holder.has_failed(status) {
      let cause = holder.last_error.clone().unwrap_or(StageError::Generator {
        pos,
        status,
        message: "generation failed".to_string(),
      });
      let _ = tx.try_send(Err(RequestError::StageFailed { pos, status, cause }));
      self.tickets.remove(pos, TicketKind::Request, level, owner);
      return request;
    }
    holder.status_waiters.push(StatusWaiter {
      status,
      owner,
      level,
      tx,
    });
    self.raise_priority(pos, priority);
    self.schedule(pos, status);
    request
  }

  /// Withdraws a pending request. Other requests for the same tile are
  /// unaffected. Returns false if it already completed.
  pub fn cancel_request(&mut self, request: &StatusRequest) -> bool {
    let pos = request.pos;
    let Some(holder) = self.holders.get_mut(&pos) else {
      return false;
    };
    let Some(index) = holder
      .status_waiters
      .iter()
      .position(|w| w.owner == request.owner)
    else {
      return false;
    };
    let waiter = holder.status_waiters.remove(index);
    let _ = waiter.tx.try_send(Err(RequestError::Cancelled));
    self
      .tickets
      .remove(pos, TicketKind::Request, waiter.level, waiter.owner);
    self.refresh(pos);
    true
  }

  /// Resident content at `pos` if it reached at least `min`. Never blocks.
  pub fn get_if_resident(&self, pos: TilePos, min: ContentStatus) -> Option<Arc<TileContent>> {
    self
      .holders
      .get(&pos)?
      .content
      .as_ref()
      .filter(|c| c.status() >= min)
      .cloned()
  }

  /// Drives `pos` to `status` and waits for it, servicing queued work on
  /// this thread meanwhile.
  pub fn load_sync(
    &mut self,
    pos: TilePos,
    status: ContentStatus,
  ) -> Result<Arc<TileContent>, RequestError> {
    let request = self.request_status(pos, status, Priority::Blocking);
    if !self.run_pending_work_while_waiting(|_| request.is_ready()) {
      return Err(RequestError::Fatal(
        "tile world stopped while loading".to_string(),
      ));
    }
    request.try_take().unwrap_or(Err(RequestError::Cancelled))
  }

  /// Services ticket updates, completions and main-thread tasks until
  /// `done` holds.
  ///
  /// Safe to call from code already running on the authoritative thread,
  /// including main-thread tasks. Returns false if a fatal error stopped the
  /// wait.
  pub fn run_pending_work_while_waiting(
    &mut self,
    mut done: impl FnMut(&TileManager) -> bool,
  ) -> bool {
    if self.wait_depth >= MAX_WAIT_DEPTH {
      self.faults.record(FatalError::invariant(
        "wait recursion too deep",
        vec![("depth", self.wait_depth.to_string())],
      ));
      return false;
    }
    self.wait_depth += 1;
    let mut backoff = Backoff::new();
    let finished = loop {
      if self.faults.is_set() {
        break false;
      }
      if done(self) {
        break true;
      }
      let mut progressed = self.process_ticket_updates();
      progressed |= self.retry_failed_stages();
      progressed |= self.drain_completions() > 0;
      progressed |= self.run_main_tasks() > 0;
      if progressed {
        backoff.reset();
      } else {
        backoff.snooze();
      }
    };
    self.wait_depth -= 1;
    finished
  }

  /// Queues work for the authoritative thread. Runs during the next tick or
  /// wait loop.
  pub fn queue_main_task(
    &self,
    task: impl FnOnce(&mut TileManager) + Send + 'static,
    priority: Priority,
  ) -> TaskHandle {
    self.main_queue.push(Box::new(task), priority)
  }

  /// Runs the main-thread tasks queued before this call.
  pub(crate) fn run_main_tasks(&mut self) -> usize {
    let budget = self.main_queue.queued();
    let mut ran = 0;
    while ran < budget {
      let Some(started) = self.main_queue.pop() else {
        break;
      };
      started.run(|task| task(self));
      ran += 1;
    }
    ran
  }

  pub(crate) fn drain_completions(&mut self) -> usize {
    let mut handled = 0;
    while let Ok(completion) = self.completion_rx.try_recv() {
      match completion {
        Completion::Stage {
          pos,
          task_id,
          status,
          result,
        } => self.complete_stage(pos, task_id, status, result),
        Completion::Load {
          pos,
          task_id,
          channel,
          result,
        } => self.complete_load(pos, task_id, channel, result),
      }
      handled += 1;
    }
    handled
  }

  // Priority

  pub fn set_priority(&mut self, pos: TilePos, priority: Priority) {
    let Some(holder) = self.holders.get_mut(&pos) else {
      return;
    };
    holder.priority = priority;
    match &holder.task {
      Some(StageTask {
        kind: StageTaskKind::Load { .. },
        ..
      }) => self.io.raise_priority(pos, priority),
      Some(task) => task.set_priority(priority),
      None => {}
    }
  }

  /// Raises the holder and its in-flight work to at least `priority`.
  pub fn raise_priority(&mut self, pos: TilePos, priority: Priority) {
    if self
      .holders
      .get(&pos)
      .is_some_and(|h| priority < h.priority)
    {
      self.set_priority(pos, priority);
    }
  }

  pub fn lower_priority(&mut self, pos: TilePos, priority: Priority) {
    if self
      .holders
      .get(&pos)
      .is_some_and(|h| priority > h.priority)
    {
      self.set_priority(pos, priority);
    }
  }

  // Scheduling

  pub(crate) fn schedule(&mut self, pos: TilePos, target: ContentStatus) {
    let Some(holder) = self.holders.get_mut(&pos) else {
      return;
    };
    if holder.current().is_some_and(|c| c >= target) {
      return;
    }
    holder.requested = holder.requested.max(Some(target));
    self.advance(pos);
  }

  /// Re-derives a holder's goal from its level, waiting neighbours and
  /// requests, then moves towards it. Work beyond a lowered goal is
  /// cancelled if it has not started, and neighbours it was waiting on are
  /// released.
  pub(crate) fn refresh(&mut self, pos: TilePos) {
    let mut work = vec![pos];
    while let Some(pos) = work.pop() {
      let (footprint, released) = {
        let Some(holder) = self.holders.get_mut(&pos) else {
          continue;
        };
        let strays = &mut self.stray_reads;
        let target = holder.target();
        let current = holder.current();
        let below = |s: ContentStatus| current.is_none_or(|c| c < s);
        if holder.requested < target && target.is_some_and(below) {
          holder.requested = target;
        }
        if holder.requested <= target {
          (Vec::new(), Vec::new())
        } else {
          holder.requested = target.filter(|t| below(*t));
          let beyond = holder
            .task
            .as_ref()
            .is_some_and(|t| Some(t.status) > holder.requested);
          let footprint = if beyond {
            withdraw_task(&mut holder.task, strays).unwrap_or_default()
          } else {
            Vec::new()
          };
          let released: Vec<TilePos> = match holder.requested {
            None => holder.blocking.drain().collect(),
            Some(_) => Vec::new(),
          };
          (footprint, released)
        }
      };
      self.release_footprint(&footprint);
      for n in released {
        if let Some(neighbour) = self.holders.get_mut(&n) {
          neighbour.waiting_for_us.remove(&pos);
          work.push(n);
        }
      }
      self.advance(pos);
      self.enqueue_unload(pos);
    }
  }

  /// Starts the next stage towards the holder's requested status, or
  /// registers on the neighbours it still waits for.
  pub(crate) fn advance(&mut self, pos: TilePos) {
    if self.closing {
      return;
    }
    let (next, priority) = {
      let Some(holder) = self.holders.get(&pos) else {
        return;
      };
      if holder.task.is_some() || !holder.blocking.is_empty() {
        return;
      }
      let Some(requested) = holder.requested else {
        return;
      };
      let next = match holder.current() {
        None => ContentStatus::Empty,
        Some(current) if current >= requested => return,
        Some(current) => match current.next() {
          Some(next) => next,
          None => return,
        },
      };
      if holder.failed_at.is_some_and(|failed| next >= failed) {
        return;
      }
      (next, holder.priority)
    };

    if next.is_load_stage() {
      self.start_load(pos, priority);
      return;
    }

    let mut missing = Vec::new();
    for n in pos.neighbours_within(next.neighbour_radius()) {
      let Some(required) = next.required_at(pos.chebyshev(n)) else {
        continue;
      };
      if !self.holders.contains_key(&n) {
        let holder = TileHolder::new(n, self.levels.level(n), self.current_tick);
        self.holders.insert(n, holder);
        self.enqueue_unload(n);
      }
      let Some(neighbour) = self.holders.get(&n) else {
        continue;
      };
      if neighbour.has_failed(required) {
        self.fail_stage(pos, next, StageError::Dependency { pos, neighbour: n });
        return;
      }
      if neighbour.current().is_none_or(|c| c < required) {
        missing.push((n, required));
      }
    }

    if missing.is_empty() {
      self.submit_stage(pos, next, priority);
      return;
    }

    if let Some(holder) = self.holders.get_mut(&pos) {
      holder.blocking.extend(missing.iter().map(|(n, _)| *n));
    }
    for (n, required) in &missing {
      if let Some(neighbour) = self.holders.get_mut(n) {
        let entry = neighbour.waiting_for_us.entry(pos).or_insert(*required);
        *entry = (*entry).max(*required);
      }
    }
    for (n, required) in missing {
      self.raise_priority(n, priority);
      self.schedule(n, required);
    }
  }

  fn start_load(&mut self, pos: TilePos, priority: Priority) {
    let task_id = self.allocate_task_id();
    let reads = Channel::ALL
      .into_iter()
      .map(|channel| {
        let tx = self.completion_tx.clone();
        self.io.read(
          channel,
          pos,
          priority,
          Box::new(move |result| {
            let _ = tx.send_blocking(Completion::Load {
              pos,
              task_id,
              channel,
              result,
            });
          }),
        )
      })
      .collect();
    if let Some(holder) = self.holders.get_mut(&pos) {
      holder.task = Some(StageTask {
        id: task_id,
        status: ContentStatus::Empty,
        kind: StageTaskKind::Load {
          reads,
          results: [None, None, None],
        },
        footprint: Vec::new(),
      });
    }
  }

  fn submit_stage(&mut self, pos: TilePos, status: ContentStatus, priority: Priority) {
    let mut neighbours = HashMap::new();
    let mut footprint = Vec::new();
    for n in pos.neighbours_within(status.neighbour_radius()) {
      if let Some(holder) = self.holders.get_mut(&n)
        && let Some(content) = &holder.content
      {
        neighbours.insert(n, Arc::clone(content));
        holder.neighbours_using += 1;
        footprint.push(n);
      }
    }
    let Some(content) = self.holders.get(&pos).and_then(|h| h.content.clone()) else {
      self.release_footprint(&footprint);
      return;
    };

    let task_id = self.allocate_task_id();
    let generator = Arc::clone(&self.generator);
    let run = move || {
      let ctx = StageContext::new(pos, status, &neighbours);
      let mut next = TileContent::clone(&content);
      run_stage(generator.as_ref(), &ctx, &mut next).map(|()| next)
    };

    let kind = if status.is_parallel() {
      let tx = self.completion_tx.clone();
      StageTaskKind::Worker(self.worker.submit(
        Box::new(move || {
          let result = run();
          let _ = tx.send_blocking(Completion::Stage {
            pos,
            task_id,
            status,
            result,
          });
        }),
        priority,
      ))
    } else {
      StageTaskKind::Main(self.main_queue.push(
        Box::new(move |manager: &mut TileManager| {
          let result = run();
          manager.complete_stage(pos, task_id, status, result);
        }),
        priority,
      ))
    };

    if let Some(holder) = self.holders.get_mut(&pos) {
      holder.task = Some(StageTask {
        id: task_id,
        status,
        kind,
        footprint,
      });
    }
  }

  pub(crate) fn release_footprint(&mut self, footprint: &[TilePos]) {
    for n in footprint {
      let idle = match self.holders.get_mut(n) {
        Some(holder) if holder.neighbours_using > 0 => {
          holder.neighbours_using -= 1;
          holder.neighbours_using == 0
        }
        _ => {
          self.faults.record(FatalError::invariant(
            "neighbour use count underflow",
            vec![("pos", n.to_string())],
          ));
          false
        }
      };
      if idle {
        self.enqueue_unload(*n);
      }
    }
  }

  /// Cancels the holder's stage or load if it has not started.
  pub(crate) fn cancel_queued_task(&mut self, pos: TilePos) -> bool {
    let Some(holder) = self.holders.get_mut(&pos) else {
      return false;
    };
    let Some(footprint) = withdraw_task(&mut holder.task, &mut self.stray_reads) else {
      return false;
    };
    self.release_footprint(&footprint);
    true
  }

  /// Consumes one late read completion of a cancelled load.
  fn absorb_stray_read(&mut self, task_id: u64) -> bool {
    let Some(remaining) = self.stray_reads.get_mut(&task_id) else {
      return false;
    };
    *remaining -= 1;
    if *remaining == 0 {
      self.stray_reads.remove(&task_id);
    }
    true
  }

  // Completions

  pub(crate) fn complete_stage(
    &mut self,
    pos: TilePos,
    task_id: u64,
    status: ContentStatus,
    result: Result<TileContent, StageError>,
  ) {
    let task = match self.holders.get_mut(&pos) {
      Some(holder) if holder.task.as_ref().is_some_and(|t| t.id == task_id) => holder.task.take(),
      _ => None,
    };
    let Some(task) = task else {
      self.task_fault("stage completed for a task that is not current", pos, task_id);
      return;
    };
    self.release_footprint(&task.footprint);

    let content = match result {
      Ok(content) => content,
      Err(e) => {
        self.fail_stage(pos, status, e);
        return;
      }
    };
    let Some(holder) = self.holders.get_mut(&pos) else {
      return;
    };
    if content.status() != status || holder.current().is_some_and(|c| c >= status) {
      let context = vec![
        ("pos", pos.to_string()),
        ("task", task_id.to_string()),
        ("stage", status.to_string()),
        ("result", content.status().to_string()),
        (
          "current",
          holder
            .current()
            .map_or_else(|| "none".to_string(), |c| c.to_string()),
        ),
      ];
      self
        .faults
        .record(FatalError::invariant("stage result does not advance status", context));
      return;
    }
    holder.content = Some(Arc::new(content));
    holder.failures = 0;
    holder.failed_at = None;
    holder.last_error = None;
    self.on_status_reached(pos);
  }

  fn complete_load(&mut self, pos: TilePos, task_id: u64, channel: Channel, result: ReadResult) {
    let complete = match self.holders.get_mut(&pos) {
      Some(holder) => match holder.task.as_mut().filter(|t| t.id == task_id) {
        Some(task) => Some(task.record_read(channel, result)),
        None => None,
      },
      None => None,
    };
    let Some(complete) = complete else {
      if !self.absorb_stray_read(task_id) {
        self.task_fault("load completed for a task that is not current", pos, task_id);
      }
      return;
    };
    if !complete {
      return;
    }

    let Some(task) = self.holders.get_mut(&pos).and_then(|h| h.task.take()) else {
      return;
    };
    let StageTaskKind::Load { results, .. } = task.kind else {
      self.task_fault("load completed for a stage task", pos, task_id);
      return;
    };
    match decode_load(pos, results) {
      Ok(content) => {
        let content = content.unwrap_or_else(|| TileContent::new(pos));
        if let Some(holder) = self.holders.get_mut(&pos) {
          debug!("Loaded tile {pos} at {}", content.status());
          holder.content = Some(Arc::new(content));
          holder.failures = 0;
          holder.failed_at = None;
          holder.last_error = None;
        }
        self.on_status_reached(pos);
      }
      Err(e) => self.fail_stage(pos, ContentStatus::Empty, e),
    }
  }

  /// Notifies everything waiting on the holder's new status and keeps
  /// driving it towards its goal.
  fn on_status_reached(&mut self, pos: TilePos) {
    let (content, satisfied, done) = {
      let Some(holder) = self.holders.get_mut(&pos) else {
        return;
      };
      let Some(content) = holder.content.clone() else {
        return;
      };
      let current = content.status();
      let satisfied: Vec<TilePos> = holder
        .waiting_for_us
        .iter()
        .filter(|(_, required)| **required <= current)
        .map(|(p, _)| *p)
        .collect();
      for p in &satisfied {
        holder.waiting_for_us.remove(p);
      }
      let (done, pending): (Vec<_>, Vec<_>) = holder
        .status_waiters
        .drain(..)
        .partition(|w| w.status <= current);
      holder.status_waiters = pending;
      if holder.requested.is_some_and(|r| r <= current) {
        holder.requested = None;
      }
      (content, satisfied, done)
    };

    for waiter in done {
      let _ = waiter.tx.try_send(Ok(Arc::clone(&content)));
      self
        .tickets
        .remove(pos, TicketKind::Request, waiter.level, waiter.owner);
    }
    for p in satisfied {
      let ready = match self.holders.get_mut(&p) {
        Some(holder) => {
          holder.blocking.remove(&pos);
          holder.blocking.is_empty()
        }
        None => false,
      };
      if ready {
        self.advance(p);
      }
    }
    if content.status() == ContentStatus::Full {
      self.schedule_autosave(pos);
      self.refresh_full_status_around(pos);
    }
    self.refresh(pos);
  }

  /// Records a failed stage or load.
  ///
  /// The first failure is retried on the next pass. A second failure is
  /// permanent: requests for the failed status or above are answered with
  /// an error and waiting neighbours fail with a dependency error.
  pub(crate) fn fail_stage(&mut self, pos: TilePos, status: ContentStatus, err: StageError) {
    error!("Tile {pos} failed at {status}: {err}");
    let Some(holder) = self.holders.get_mut(&pos) else {
      return;
    };
    holder.requested = None;
    holder.failures += 1;
    holder.failed_at = Some(status);
    holder.last_error = Some(err.clone());
    let released: Vec<TilePos> = holder.blocking.drain().collect();

    let mut failed_waiters = Vec::new();
    let mut dependents = Vec::new();
    if holder.failures < 2 {
      self.retry_list.push(pos);
    } else {
      let (failed, pending): (Vec<_>, Vec<_>) = holder
        .status_waiters
        .drain(..)
        .partition(|w| w.status >= status);
      holder.status_waiters = pending;
      failed_waiters = failed;
      dependents = holder
        .waiting_for_us
        .iter()
        .filter(|(_, required)| **required >= status)
        .map(|(p, _)| *p)
        .collect();
      for p in &dependents {
        holder.waiting_for_us.remove(p);
      }
    }

    for n in released {
      if let Some(neighbour) = self.holders.get_mut(&n) {
        neighbour.waiting_for_us.remove(&pos);
      }
      self.refresh(n);
    }
    for waiter in failed_waiters {
      let _ = waiter.tx.try_send(Err(RequestError::StageFailed {
        pos,
        status: waiter.status,
        cause: err.clone(),
      }));
      self
        .tickets
        .remove(pos, TicketKind::Request, waiter.level, waiter.owner);
    }
    for p in dependents {
      let next = match self.holders.get_mut(&p) {
        Some(holder) => {
          holder.blocking.remove(&pos);
          holder
            .current()
            .map_or(Some(ContentStatus::Empty), ContentStatus::next)
        }
        None => None,
      };
      if let Some(next) = next {
        self.fail_stage(p, next, StageError::Dependency { pos: p, neighbour: pos });
      }
    }
    self.enqueue_unload(pos);
  }

  /// Gives holders with a single failure another attempt.
  pub(crate) fn retry_failed_stages(&mut self) -> bool {
    if self.retry_list.is_empty() {
      return false;
    }
    for pos in std::mem::take(&mut self.retry_list) {
      if let Some(holder) = self.holders.get_mut(&pos)
        && holder.failures < 2
      {
        holder.failed_at = None;
      }
      self.refresh(pos);
    }
    true
  }
}
