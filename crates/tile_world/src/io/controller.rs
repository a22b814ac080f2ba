//! Coalescing read/write controller for one channel.
//!
//! Every (tile, channel) has at most one [`IoTask`] at a time. Reads and
//! writes for a tile attach to that task:
//! - a read while a write is pending is served from the pending payload
//! - a write while another write is in flight replaces the pending payload
//!   and re-triggers once the in-flight write lands, so the last write wins
//!   and none is silently lost
//! - a read that joins an in-flight read after a write landed is re-read,
//!   never served bytes fetched before that write
//! - a failed write stays pending and is retried by the next write,
//!   [`IoController::retry_failed_writes`] or [`IoController::flush`]
//!
//! Compression runs on the compute executor; storage access runs on the I/O
//! executor through per-container queues.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bevy::log::{debug, error};

use super::container::{ContainerJob, ContainerQueue};
use crate::coords::{ContainerPos, TilePos};
use crate::error::{FatalError, FaultSlot, IoError, StorageError};
use crate::executor::{Backoff, PrioritisedExecutor, Priority, TaskHandle, panic_message};
use crate::storage::{Channel, RegionStorage};

/// Decompressed payload shared between waiters.
pub type Payload = Arc<[u8]>;

/// Result delivered to read callbacks. `Ok(None)` means absent on disk.
pub type ReadResult = Result<Option<Payload>, IoError>;

/// Completion callback for a read. Runs on an executor thread.
pub type ReadCallback = Box<dyn FnOnce(ReadResult) + Send + 'static>;

/// Most recent activity of an I/O task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoPhase {
  Reading,
  Decompressing,
  WriteCompress,
  WriteIo,
  /// Holding a payload whose last write attempt failed.
  Failed,
  Idle,
}

struct PendingWrite {
  seq: u64,
  payload: Option<Payload>,
}

struct ReadWaiter {
  id: u64,
  /// `written_seq` when the waiter attached.
  seen: u64,
  callback: ReadCallback,
}

struct IoTask {
  id: u64,
  priority: Priority,
  phase: IoPhase,
  waiters: Vec<ReadWaiter>,
  /// Newest scheduled write not yet known to be on disk.
  latest: Option<PendingWrite>,
  written_seq: u64,
  /// `written_seq` when the in-flight storage read started.
  read_seq: u64,
  reading: bool,
  writing: bool,
  failed: bool,
  compress: Option<TaskHandle>,
}

impl IoTask {
  fn new(id: u64, priority: Priority) -> Self {
    Self {
      id,
      priority,
      phase: IoPhase::Idle,
      waiters: Vec::new(),
      latest: None,
      written_seq: 0,
      read_seq: 0,
      reading: false,
      writing: false,
      failed: false,
      compress: None,
    }
  }

  fn is_finished(&self) -> bool {
    !self.reading && !self.writing && self.latest.is_none() && self.waiters.is_empty()
  }

  fn settle_phase(&mut self) {
    self.phase = if self.writing {
      IoPhase::WriteCompress
    } else if self.reading {
      IoPhase::Reading
    } else if self.failed {
      IoPhase::Failed
    } else {
      IoPhase::Idle
    };
  }
}

#[derive(Default)]
struct ControllerState {
  tasks: HashMap<TilePos, IoTask>,
  containers: HashMap<ContainerPos, ContainerQueue>,
  next_task_id: u64,
  next_seq: u64,
  next_waiter: u64,
  next_job: u64,
}

impl ControllerState {
  fn task(&mut self, pos: TilePos, priority: Priority) -> &mut IoTask {
    let next_id = &mut self.next_task_id;
    self.tasks.entry(pos).or_insert_with(|| {
      *next_id += 1;
      IoTask::new(*next_id, priority)
    })
  }
}

/// Handle to a scheduled read, used to withdraw the callback.
pub struct ReadHandle {
  controller: Weak<IoController>,
  channel: Channel,
  pos: TilePos,
  waiter: Option<u64>,
}

impl ReadHandle {
  pub fn pos(&self) -> TilePos {
    self.pos
  }

  pub fn channel(&self) -> Channel {
    self.channel
  }

  /// Removes this caller's callback without affecting other waiters or the
  /// underlying I/O. Returns false if the callback already ran.
  pub fn cancel(&self) -> bool {
    match (self.waiter, self.controller.upgrade()) {
      (Some(waiter), Some(controller)) => controller.cancel_read(self.pos, waiter),
      _ => false,
    }
  }
}

/// Asynchronous storage controller for one channel.
///
/// Executors passed in must run jobs on their own threads, never inline in
/// `submit`.
pub struct IoController {
  channel: Channel,
  storage: Arc<dyn RegionStorage>,
  compute: Arc<dyn PrioritisedExecutor>,
  io: Arc<dyn PrioritisedExecutor>,
  state: Mutex<ControllerState>,
  faults: FaultSlot,
  closed: AtomicBool,
  this: Weak<IoController>,
}

impl IoController {
  pub fn new(
    channel: Channel,
    storage: Arc<dyn RegionStorage>,
    compute: Arc<dyn PrioritisedExecutor>,
    io: Arc<dyn PrioritisedExecutor>,
    faults: FaultSlot,
  ) -> Arc<Self> {
    Arc::new_cyclic(|this| Self {
      channel,
      storage,
      compute,
      io,
      state: Mutex::new(ControllerState::default()),
      faults,
      closed: AtomicBool::new(false),
      this: this.clone(),
    })
  }

  pub fn channel(&self) -> Channel {
    self.channel
  }

  pub fn storage(&self) -> &Arc<dyn RegionStorage> {
    &self.storage
  }

  fn lock(&self) -> MutexGuard<'_, ControllerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Schedules a read; `callback` receives the newest data for `pos`.
  ///
  /// If a write is pending, the callback runs immediately with its payload.
  pub fn read(&self, pos: TilePos, priority: Priority, callback: ReadCallback) -> ReadHandle {
    let mut handle = ReadHandle {
      controller: self.this.clone(),
      channel: self.channel,
      pos,
      waiter: None,
    };
    if self.is_closed() {
      callback(Err(IoError::Shutdown {
        channel: self.channel,
      }));
      return handle;
    }

    let mut state = self.lock();
    state.next_waiter += 1;
    let waiter = state.next_waiter;
    let task = state.task(pos, priority);
    task.priority = task.priority.most_urgent(priority);

    if let Some(write) = &task.latest {
      let payload = write.payload.clone();
      drop(state);
      callback(Ok(payload));
      return handle;
    }

    let seen = task.written_seq;
    task.waiters.push(ReadWaiter {
      id: waiter,
      seen,
      callback,
    });
    handle.waiter = Some(waiter);
    if !task.reading {
      task.reading = true;
      self.enqueue_read(&mut state, pos);
    }
    handle
  }

  fn enqueue_read(&self, state: &mut ControllerState, pos: TilePos) {
    let Some(task) = state.tasks.get_mut(&pos) else {
      return;
    };
    task.phase = IoPhase::Reading;
    let job = ContainerJob::Read {
      pos,
      task_id: task.id,
    };
    let priority = task.priority;
    self.enqueue(state, priority, job);
  }

  /// Schedules a write of `payload` (None deletes the tile).
  pub fn write(
    &self,
    pos: TilePos,
    payload: Option<Vec<u8>>,
    priority: Priority,
  ) -> Result<(), IoError> {
    if self.is_closed() {
      return Err(IoError::Shutdown {
        channel: self.channel,
      });
    }
    let mut state = self.lock();
    state.next_seq += 1;
    let seq = state.next_seq;
    let task = state.task(pos, priority);
    task.priority = task.priority.most_urgent(priority);
    task.latest = Some(PendingWrite {
      seq,
      payload: payload.map(Payload::from),
    });
    task.failed = false;
    if !task.writing {
      task.writing = true;
      task.phase = IoPhase::WriteCompress;
      task.compress = Some(self.submit_compress(pos, task.id, task.priority));
    }
    Ok(())
  }

  /// Raises the priority of queued work for `pos`.
  pub fn raise_priority(&self, pos: TilePos, priority: Priority) {
    let mut state = self.lock();
    let Some(task) = state.tasks.get_mut(&pos) else {
      return;
    };
    if priority >= task.priority {
      return;
    }
    task.priority = priority;
    if let Some(compress) = &task.compress {
      compress.raise_priority(priority);
    }
    let container = self.storage.container_of(pos);
    if let Some(queue) = state.containers.get_mut(&container) {
      queue.raise(pos, priority);
    }
  }

  /// Tasks currently tracked, including failed writes.
  pub fn outstanding(&self) -> usize {
    self.lock().tasks.len()
  }

  /// Tasks with a read or write in progress.
  pub fn in_flight(&self) -> usize {
    self
      .lock()
      .tasks
      .values()
      .filter(|t| t.reading || t.writing)
      .count()
  }

  /// Id of the live task for `pos`, if any.
  pub fn task_id(&self, pos: TilePos) -> Option<u64> {
    self.lock().tasks.get(&pos).map(|t| t.id)
  }

  pub fn phase(&self, pos: TilePos) -> Option<IoPhase> {
    self.lock().tasks.get(&pos).map(|t| t.phase)
  }

  /// Tiles whose newest write failed and has not been retried yet.
  pub fn failed_keys(&self) -> Vec<TilePos> {
    let mut keys: Vec<_> = self
      .lock()
      .tasks
      .iter()
      .filter(|(_, t)| t.failed)
      .map(|(pos, _)| *pos)
      .collect();
    keys.sort();
    keys
  }

  /// Spins with backoff until fewer than `limit` tasks are in flight.
  pub fn wait_for_in_flight_below(&self, limit: usize) {
    let mut backoff = Backoff::new();
    while self.in_flight() >= limit.max(1) {
      backoff.snooze();
    }
  }

  /// Resubmits every failed write. Returns how many were retried.
  pub fn retry_failed_writes(&self) -> usize {
    let mut state = self.lock();
    let mut retried = 0;
    for (pos, task) in state.tasks.iter_mut() {
      if task.failed && !task.writing && task.latest.is_some() {
        task.failed = false;
        task.writing = true;
        task.phase = IoPhase::WriteCompress;
        task.compress = Some(self.submit_compress(*pos, task.id, task.priority));
        retried += 1;
      }
    }
    if retried > 0 {
      debug!("Retrying {retried} failed {} writes", self.channel);
    }
    retried
  }

  /// Retries failed writes once, waits for all in-flight work and syncs
  /// storage. Returns the tiles whose writes still failed.
  pub fn flush(&self) -> Vec<TilePos> {
    self.retry_failed_writes();
    self.wait_for_in_flight_below(1);
    if let Err(e) = self.storage.flush() {
      error!("Failed to flush {} storage: {e}", self.channel);
    }
    self.failed_keys()
  }

  /// Flushes, rejects further work and closes storage.
  ///
  /// Returns the tiles whose data could not be written and was dropped.
  pub fn close(&self) -> Vec<TilePos> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Vec::new();
    }
    let failed = self.flush();
    let waiters: Vec<_> = {
      let mut state = self.lock();
      for pos in &failed {
        error!("Dropping unwritten {} data for tile {pos}", self.channel);
      }
      state.containers.clear();
      state
        .tasks
        .drain()
        .flat_map(|(_, task)| task.waiters)
        .collect()
    };
    for waiter in waiters {
      (waiter.callback)(Err(IoError::Shutdown {
        channel: self.channel,
      }));
    }
    if let Err(e) = self.storage.close() {
      error!("Failed to close {} storage: {e}", self.channel);
    }
    failed
  }

  fn cancel_read(&self, pos: TilePos, waiter: u64) -> bool {
    let mut state = self.lock();
    let Some(task) = state.tasks.get_mut(&pos) else {
      return false;
    };
    let Some(index) = task.waiters.iter().position(|w| w.id == waiter) else {
      return false;
    };
    // Dropped without running.
    let _withdrawn = task.waiters.remove(index);
    if task.is_finished() {
      state.tasks.remove(&pos);
    }
    true
  }

  fn task_mismatch(&self, pos: TilePos, expected: u64, found: Option<u64>) {
    self.faults.record(FatalError::invariant(
      "io task replaced while in flight",
      vec![
        ("channel", self.channel.to_string()),
        ("pos", pos.to_string()),
        ("expected task", expected.to_string()),
        (
          "found task",
          found.map_or_else(|| "none".to_string(), |id| id.to_string()),
        ),
      ],
    ));
  }

  fn enqueue(&self, state: &mut ControllerState, priority: Priority, job: ContainerJob) {
    let container = self.storage.container_of(job.pos());
    state.next_job += 1;
    let seq = state.next_job;
    let queue = state.containers.entry(container).or_default();
    queue.push(seq, priority, job);
    match &queue.drain {
      Some(drain) => drain.raise_priority(priority),
      None => queue.drain = Some(self.submit_drain(container, priority)),
    }
  }

  fn submit_drain(&self, container: ContainerPos, priority: Priority) -> TaskHandle {
    let this = self.this.clone();
    self.io.submit(
      Box::new(move || {
        if let Some(controller) = this.upgrade() {
          controller.drain_one(container);
        }
      }),
      priority,
    )
  }

  fn submit_compress(&self, pos: TilePos, task_id: u64, priority: Priority) -> TaskHandle {
    let this = self.this.clone();
    self.compute.submit(
      Box::new(move || {
        let Some(controller) = this.upgrade() else {
          return;
        };
        let compressed = catch_unwind(AssertUnwindSafe(|| controller.compress(pos, task_id)));
        if let Err(payload) = compressed {
          controller.abort_compress(pos, task_id, panic_message(payload.as_ref()));
        }
      }),
      priority,
    )
  }

  /// Runs the head job of one container queue, then hands the queue to a
  /// fresh drain task if more jobs are waiting.
  fn drain_one(&self, container: ContainerPos) {
    let job = {
      let mut state = self.lock();
      let Some(job) = state.containers.get_mut(&container).and_then(|q| q.pop()) else {
        state.containers.remove(&container);
        return;
      };
      match &job {
        ContainerJob::Write { pos, .. } => {
          if let Some(task) = state.tasks.get_mut(pos) {
            task.phase = IoPhase::WriteIo;
          }
        }
        // Writes to this container cannot land until the read finishes.
        ContainerJob::Read { pos, .. } => {
          if let Some(task) = state.tasks.get_mut(pos) {
            task.read_seq = task.written_seq;
          }
        }
      }
      job
    };

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.run_job(job))) {
      self.faults.record(FatalError::invariant(
        "storage job panicked",
        vec![
          ("channel", self.channel.to_string()),
          ("container", container.to_string()),
          ("panic", panic_message(payload.as_ref())),
        ],
      ));
    }

    let mut state = self.lock();
    let next = state
      .containers
      .get(&container)
      .and_then(ContainerQueue::head_priority);
    match next {
      Some(priority) => {
        let drain = self.submit_drain(container, priority);
        if let Some(queue) = state.containers.get_mut(&container) {
          queue.drain = Some(drain);
        }
      }
      None => {
        state.containers.remove(&container);
      }
    }
  }

  fn run_job(&self, job: ContainerJob) {
    match job {
      ContainerJob::Read { pos, task_id } => match self.storage.read_raw(pos) {
        Ok(Some(raw)) => self.decompress_later(pos, task_id, raw),
        Ok(None) => self.complete_read(pos, task_id, Ok(None)),
        Err(e) => self.complete_read(pos, task_id, Err(self.storage_error(pos, &e))),
      },
      ContainerJob::Write {
        pos,
        task_id,
        seq,
        data,
      } => {
        let result = self.storage.write_raw(pos, data.as_deref());
        self.complete_write(pos, task_id, seq, result);
      }
    }
  }

  fn storage_error(&self, pos: TilePos, err: &StorageError) -> IoError {
    IoError::Storage {
      channel: self.channel,
      pos,
      message: err.to_string(),
    }
  }

  fn decompress_later(&self, pos: TilePos, task_id: u64, raw: Vec<u8>) {
    let priority = {
      let mut state = self.lock();
      match state.tasks.get_mut(&pos) {
        Some(task) => {
          task.phase = IoPhase::Decompressing;
          task.priority
        }
        None => Priority::Normal,
      }
    };
    let this = self.this.clone();
    let channel = self.channel;
    self.compute.submit(
      Box::new(move || {
        let Some(controller) = this.upgrade() else {
          return;
        };
        let decoded = catch_unwind(AssertUnwindSafe(|| {
          lz4_flex::decompress_size_prepended(&raw)
        }));
        let result = decoded
          .map_err(|payload| panic_message(payload.as_ref()))
          .and_then(|decoded| decoded.map_err(|e| e.to_string()))
          .map(Some)
          .map_err(|reason| IoError::Decompress {
            channel,
            pos,
            reason,
          });
        controller.complete_read(pos, task_id, result);
      }),
      priority,
    );
  }

  fn complete_read(&self, pos: TilePos, task_id: u64, result: Result<Option<Vec<u8>>, IoError>) {
    let (waiters, result) = {
      let mut state = self.lock();
      let Some(task) = state.tasks.get_mut(&pos).filter(|t| t.id == task_id) else {
        let found = state.tasks.get(&pos).map(|t| t.id);
        drop(state);
        self.task_mismatch(pos, task_id, found);
        return;
      };
      // A write scheduled while reading is newer than what storage returned.
      let (waiters, result) = match &task.latest {
        Some(write) => (
          std::mem::take(&mut task.waiters),
          Ok(write.payload.clone()),
        ),
        None => {
          // Waiters that attached after a write landed need a fresh read.
          let read_seq = task.read_seq;
          let (current, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut task.waiters)
            .into_iter()
            .partition(|w| w.seen <= read_seq);
          task.waiters = stale;
          (current, result.map(|data| data.map(Payload::from)))
        }
      };
      if task.waiters.is_empty() {
        task.reading = false;
        task.settle_phase();
        if task.is_finished() {
          state.tasks.remove(&pos);
        }
      } else {
        debug!(
          "Re-reading {} tile {pos} for {} waiters behind a landed write",
          self.channel,
          task.waiters.len()
        );
        self.enqueue_read(&mut state, pos);
      }
      (waiters, result)
    };

    if let Err(e) = &result {
      error!("Read failed for tile {pos} (task {task_id}): {e}");
    }
    for waiter in waiters {
      (waiter.callback)(result.clone());
    }
  }

  fn compress(&self, pos: TilePos, task_id: u64) {
    let (seq, payload, priority) = {
      let mut state = self.lock();
      let Some(task) = state.tasks.get_mut(&pos).filter(|t| t.id == task_id) else {
        let found = state.tasks.get(&pos).map(|t| t.id);
        drop(state);
        self.task_mismatch(pos, task_id, found);
        return;
      };
      let Some(write) = &task.latest else {
        let context = vec![
          ("channel", self.channel.to_string()),
          ("pos", pos.to_string()),
          ("task", task_id.to_string()),
        ];
        task.writing = false;
        drop(state);
        self
          .faults
          .record(FatalError::invariant("write scheduled without payload", context));
        return;
      };
      task.phase = IoPhase::WriteCompress;
      (write.seq, write.payload.clone(), task.priority)
    };

    let data = payload.map(|bytes| lz4_flex::compress_prepend_size(&bytes));
    let mut state = self.lock();
    self.enqueue(
      &mut state,
      priority,
      ContainerJob::Write {
        pos,
        task_id,
        seq,
        data,
      },
    );
  }

  /// Parks a write whose compression panicked as failed, keeping its payload.
  fn abort_compress(&self, pos: TilePos, task_id: u64, panic: String) {
    {
      let mut state = self.lock();
      if let Some(task) = state.tasks.get_mut(&pos).filter(|t| t.id == task_id) {
        task.writing = false;
        task.compress = None;
        task.failed = true;
        task.settle_phase();
      }
    }
    self.faults.record(FatalError::invariant(
      "compression panicked",
      vec![
        ("channel", self.channel.to_string()),
        ("pos", pos.to_string()),
        ("task", task_id.to_string()),
        ("panic", panic),
      ],
    ));
  }

  fn complete_write(&self, pos: TilePos, task_id: u64, seq: u64, result: Result<(), StorageError>) {
    let mut state = self.lock();
    let Some(task) = state.tasks.get_mut(&pos).filter(|t| t.id == task_id) else {
      let found = state.tasks.get(&pos).map(|t| t.id);
      drop(state);
      self.task_mismatch(pos, task_id, found);
      return;
    };
    task.writing = false;
    task.compress = None;
    let newer = task.latest.as_ref().is_some_and(|w| w.seq > seq);

    match result {
      Ok(()) => {
        task.written_seq = task.written_seq.max(seq);
        if !newer {
          task.latest = None;
          task.failed = false;
        }
      }
      Err(e) => {
        error!(
          "Write failed for {} tile {pos} (task {task_id}): {e}",
          self.channel
        );
        task.failed = !newer;
      }
    }

    if newer {
      task.writing = true;
      task.compress = Some(self.submit_compress(pos, task.id, task.priority));
    }
    task.settle_phase();
    if task.is_finished() {
      state.tasks.remove(&pos);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::executor::{Job, TaskQueue};
  use crate::storage::MemoryStorage;

  #[derive(Default)]
  struct ManualExecutor {
    queue: TaskQueue<Job>,
  }

  impl ManualExecutor {
    fn run_all(&self) -> usize {
      let mut ran = 0;
      while let Some(started) = self.queue.pop() {
        started.run(|job| job());
        ran += 1;
      }
      ran
    }
  }

  impl PrioritisedExecutor for ManualExecutor {
    fn submit(&self, task: Job, priority: Priority) -> TaskHandle {
      self.queue.push(task, priority)
    }

    fn outstanding(&self) -> usize {
      self.queue.queued() + self.queue.running()
    }
  }

  #[test]
  fn aborted_compression_parks_the_write_as_failed() {
    let storage = Arc::new(MemoryStorage::new(2));
    let compute = Arc::new(ManualExecutor::default());
    let io = Arc::new(ManualExecutor::default());
    let faults = FaultSlot::default();
    let controller = IoController::new(
      Channel::Tiles,
      Arc::clone(&storage) as Arc<dyn RegionStorage>,
      Arc::clone(&compute) as Arc<dyn PrioritisedExecutor>,
      Arc::clone(&io) as Arc<dyn PrioritisedExecutor>,
      faults.clone(),
    );
    let pos = TilePos::new(1, -1);

    controller
      .write(pos, Some(b"kept".to_vec()), Priority::Normal)
      .unwrap();
    let task_id = controller.task_id(pos).unwrap();
    // Stand in for a compress job that unwound before enqueueing its write.
    assert_eq!(compute.queue.cancel_all(), 1);
    controller.abort_compress(pos, task_id, "boom".to_string());

    assert!(faults.is_set());
    assert_eq!(controller.in_flight(), 0);
    assert_eq!(controller.phase(pos), Some(IoPhase::Failed));
    assert_eq!(controller.failed_keys(), vec![pos]);

    assert_eq!(controller.retry_failed_writes(), 1);
    while compute.run_all() + io.run_all() > 0 {}
    assert!(controller.failed_keys().is_empty());
    assert_eq!(controller.outstanding(), 0);
    assert!(storage.get(pos).is_some());
  }
}
