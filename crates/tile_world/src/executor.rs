//! Prioritised task execution.
//!
//! Work is submitted to a [`TaskQueue`] ordered by [`Priority`] and then by
//! submission order. A [`TaskHandle`] can reprioritise or cancel its task
//! while it is still queued. [`RayonExecutor`] drains a queue on a rayon
//! thread pool; the authoritative loop drains its own queue directly.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bevy::log::error;

/// Task priority. Earlier variants run first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
  /// A caller is spinning on the result.
  Blocking = 0,
  Highest,
  Higher,
  High,
  #[default]
  Normal,
  Low,
  Lower,
  Lowest,
  Idle,
}

impl Priority {
  const ALL: [Priority; 9] = [
    Priority::Blocking,
    Priority::Highest,
    Priority::Higher,
    Priority::High,
    Priority::Normal,
    Priority::Low,
    Priority::Lower,
    Priority::Lowest,
    Priority::Idle,
  ];

  fn from_u8(value: u8) -> Self {
    Self::ALL
      .get(value as usize)
      .copied()
      .unwrap_or(Priority::Idle)
  }

  /// One step more urgent, saturating at [`Priority::Blocking`].
  pub fn raised(self) -> Self {
    Self::from_u8((self as u8).saturating_sub(1))
  }

  /// One step less urgent, saturating at [`Priority::Idle`].
  pub fn lowered(self) -> Self {
    Self::from_u8((self as u8 + 1).min(Priority::Idle as u8))
  }

  /// The more urgent of two priorities.
  pub fn most_urgent(self, other: Self) -> Self {
    self.min(other)
  }
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

trait QueueControl: Send + Sync {
  fn reprioritise(&self, task: &TaskShared, priority: Priority);
  fn cancel(&self, task: &TaskShared) -> bool;
}

struct TaskShared {
  id: u64,
  state: AtomicU8,
  priority: AtomicU8,
  queue: Weak<dyn QueueControl>,
}

impl TaskShared {
  fn priority(&self) -> Priority {
    Priority::from_u8(self.priority.load(Ordering::Acquire))
  }
}

/// Handle to a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
  shared: Arc<TaskShared>,
}

impl TaskHandle {
  /// Submission id, unique per queue.
  pub fn id(&self) -> u64 {
    self.shared.id
  }

  pub fn priority(&self) -> Priority {
    self.shared.priority()
  }

  /// Changes the priority. Has no effect on ordering once the task started.
  pub fn set_priority(&self, priority: Priority) {
    match self.shared.queue.upgrade() {
      Some(queue) => queue.reprioritise(&self.shared, priority),
      None => self.shared.priority.store(priority as u8, Ordering::Release),
    }
  }

  /// Raises the priority to at least `priority`.
  pub fn raise_priority(&self, priority: Priority) {
    if priority < self.priority() {
      self.set_priority(priority);
    }
  }

  /// Lowers the priority to at most `priority`.
  pub fn lower_priority(&self, priority: Priority) {
    if priority > self.priority() {
      self.set_priority(priority);
    }
  }

  /// Removes the task from its queue.
  ///
  /// Returns true only if the task had not started; it will never run.
  pub fn cancel(&self) -> bool {
    self
      .shared
      .queue
      .upgrade()
      .is_some_and(|queue| queue.cancel(&self.shared))
  }

  pub fn is_queued(&self) -> bool {
    self.shared.state.load(Ordering::Acquire) == QUEUED
  }

  pub fn is_running(&self) -> bool {
    self.shared.state.load(Ordering::Acquire) == RUNNING
  }

  /// Returns true once the task ran to completion or was cancelled.
  pub fn is_finished(&self) -> bool {
    matches!(self.shared.state.load(Ordering::Acquire), DONE | CANCELLED)
  }
}

impl std::fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskHandle")
      .field("id", &self.shared.id)
      .field("priority", &self.priority())
      .field("state", &self.shared.state.load(Ordering::Relaxed))
      .finish()
  }
}

type QueueMap<J> = BTreeMap<(Priority, u64), (Arc<TaskShared>, J)>;

struct QueueInner<J> {
  entries: Mutex<QueueMap<J>>,
  next_id: AtomicU64,
  running: Arc<AtomicUsize>,
}

impl<J> QueueInner<J> {
  fn lock(&self) -> MutexGuard<'_, QueueMap<J>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<J: Send + 'static> QueueControl for QueueInner<J> {
  fn reprioritise(&self, task: &TaskShared, priority: Priority) {
    let mut entries = self.lock();
    let old = task.priority();
    if old != priority
      && let Some(entry) = entries.remove(&(old, task.id))
    {
      entries.insert((priority, task.id), entry);
    }
    task.priority.store(priority as u8, Ordering::Release);
  }

  fn cancel(&self, task: &TaskShared) -> bool {
    let mut entries = self.lock();
    if entries.remove(&(task.priority(), task.id)).is_some() {
      task.state.store(CANCELLED, Ordering::Release);
      true
    } else {
      false
    }
  }
}

/// Priority queue of jobs with reprioritisable handles.
pub struct TaskQueue<J> {
  inner: Arc<QueueInner<J>>,
}

impl<J> Clone for TaskQueue<J> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<J: Send + 'static> Default for TaskQueue<J> {
  fn default() -> Self {
    Self::new()
  }
}

impl<J: Send + 'static> TaskQueue<J> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(QueueInner {
        entries: Mutex::new(BTreeMap::new()),
        next_id: AtomicU64::new(1),
        running: Arc::new(AtomicUsize::new(0)),
      }),
    }
  }

  /// Enqueues a job.
  pub fn push(&self, job: J, priority: Priority) -> TaskHandle {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let queue: Weak<dyn QueueControl> = Arc::downgrade(&self.inner) as Weak<dyn QueueControl>;
    let shared = Arc::new(TaskShared {
      id,
      state: AtomicU8::new(QUEUED),
      priority: AtomicU8::new(priority as u8),
      queue,
    });
    self
      .inner
      .lock()
      .insert((priority, id), (Arc::clone(&shared), job));
    TaskHandle { shared }
  }

  /// Takes the most urgent job and marks it running.
  pub fn pop(&self) -> Option<Started<J>> {
    let (_, (shared, job)) = self.inner.lock().pop_first()?;
    shared.state.store(RUNNING, Ordering::Release);
    self.inner.running.fetch_add(1, Ordering::AcqRel);
    Some(Started {
      job,
      guard: RunningGuard {
        shared,
        running: Arc::clone(&self.inner.running),
      },
    })
  }

  /// Cancels every queued job and returns how many were dropped.
  pub fn cancel_all(&self) -> usize {
    let drained = std::mem::take(&mut *self.inner.lock());
    for (shared, _) in drained.values() {
      shared.state.store(CANCELLED, Ordering::Release);
    }
    drained.len()
  }

  /// Jobs waiting to start.
  pub fn queued(&self) -> usize {
    self.inner.lock().len()
  }

  /// Jobs started but not yet finished.
  pub fn running(&self) -> usize {
    self.inner.running.load(Ordering::Acquire)
  }

  /// Returns true if nothing is queued or running.
  pub fn is_idle(&self) -> bool {
    self.queued() == 0 && self.running() == 0
  }
}

struct RunningGuard {
  shared: Arc<TaskShared>,
  running: Arc<AtomicUsize>,
}

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.running.fetch_sub(1, Ordering::AcqRel);
    self.shared.state.store(DONE, Ordering::Release);
  }
}

/// A job taken from a [`TaskQueue`]. Counts as running until consumed.
pub struct Started<J> {
  job: J,
  guard: RunningGuard,
}

impl<J> Started<J> {
  pub fn id(&self) -> u64 {
    self.guard.shared.id
  }

  /// Runs the job, marking it finished afterwards (also on panic).
  pub fn run<R>(self, f: impl FnOnce(J) -> R) -> R {
    let Started { job, guard } = self;
    let result = f(job);
    drop(guard);
    result
  }
}

/// A boxed unit of work for an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An executor accepting prioritised work.
pub trait PrioritisedExecutor: Send + Sync {
  /// Queues `task`; the handle can reprioritise or cancel it before it starts.
  fn submit(&self, task: Job, priority: Priority) -> TaskHandle;

  /// Tasks queued or running.
  fn outstanding(&self) -> usize;
}

/// Executor backed by a dedicated rayon thread pool.
///
/// Each submission enqueues the job and spawns one pool task that runs the
/// most urgent queued job, so priority changes made before a worker picks the
/// job up are honoured.
pub struct RayonExecutor {
  pool: rayon::ThreadPool,
  queue: TaskQueue<Job>,
}

impl RayonExecutor {
  pub fn new(name: &'static str, threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(threads.max(1))
      .thread_name(move |i| format!("{name}-{i}"))
      .panic_handler(move |payload| {
        error!("{name} worker panicked: {}", panic_message(payload.as_ref()));
      })
      .build()?;
    Ok(Self {
      pool,
      queue: TaskQueue::new(),
    })
  }

  pub fn queue(&self) -> &TaskQueue<Job> {
    &self.queue
  }
}

impl PrioritisedExecutor for RayonExecutor {
  fn submit(&self, task: Job, priority: Priority) -> TaskHandle {
    let handle = self.queue.push(task, priority);
    let queue = self.queue.clone();
    self.pool.spawn(move || {
      if let Some(started) = queue.pop() {
        started.run(|job| job());
      }
    });
    handle
  }

  fn outstanding(&self) -> usize {
    self.queue.queued() + self.queue.running()
  }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

/// Bounded backoff for busy-wait loops: spin, then yield, then short sleeps.
#[derive(Debug, Default)]
pub struct Backoff {
  step: u32,
}

impl Backoff {
  const SPIN_LIMIT: u32 = 6;
  const YIELD_LIMIT: u32 = 10;
  const MAX_SLEEP: Duration = Duration::from_millis(1);

  pub fn new() -> Self {
    Self::default()
  }

  pub fn reset(&mut self) {
    self.step = 0;
  }

  pub fn snooze(&mut self) {
    if self.step < Self::SPIN_LIMIT {
      for _ in 0..(1u32 << self.step) {
        std::hint::spin_loop();
      }
    } else if self.step < Self::YIELD_LIMIT {
      std::thread::yield_now();
    } else {
      let shift = (self.step - Self::YIELD_LIMIT).min(5);
      let sleep = Duration::from_micros(50u64 << shift).min(Self::MAX_SLEEP);
      std::thread::sleep(sleep);
    }
    self.step = self.step.saturating_add(1);
  }
}
