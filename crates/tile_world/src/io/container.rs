//! Per-container job queues.
//!
//! Jobs touching the same backing container run one at a time, in priority
//! order. Each non-empty queue owns at most one drain task on the I/O
//! executor; different containers drain in parallel.

use std::collections::BTreeMap;

use crate::coords::TilePos;
use crate::executor::{Priority, TaskHandle};

/// Storage operation for one tile.
pub(super) enum ContainerJob {
  Read {
    pos: TilePos,
    task_id: u64,
  },
  Write {
    pos: TilePos,
    task_id: u64,
    seq: u64,
    data: Option<Vec<u8>>,
  },
}

impl ContainerJob {
  pub(super) fn pos(&self) -> TilePos {
    match self {
      Self::Read { pos, .. } | Self::Write { pos, .. } => *pos,
    }
  }
}

#[derive(Default)]
pub(super) struct ContainerQueue {
  jobs: BTreeMap<(Priority, u64), ContainerJob>,
  /// Drain task currently queued or running for this container.
  pub(super) drain: Option<TaskHandle>,
}

impl ContainerQueue {
  pub(super) fn push(&mut self, seq: u64, priority: Priority, job: ContainerJob) {
    self.jobs.insert((priority, seq), job);
  }

  pub(super) fn pop(&mut self) -> Option<ContainerJob> {
    self.jobs.pop_first().map(|(_, job)| job)
  }

  pub(super) fn head_priority(&self) -> Option<Priority> {
    self.jobs.first_key_value().map(|((p, _), _)| *p)
  }

  #[cfg(test)]
  fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }

  /// Moves every job for `pos` up to at least `priority`.
  pub(super) fn raise(&mut self, pos: TilePos, priority: Priority) {
    let keys: Vec<_> = self
      .jobs
      .iter()
      .filter(|((p, _), job)| *p > priority && job.pos() == pos)
      .map(|(key, _)| *key)
      .collect();
    for key in keys {
      if let Some(job) = self.jobs.remove(&key) {
        self.jobs.insert((priority, key.1), job);
      }
    }
    if let Some(drain) = &self.drain {
      drain.raise_priority(priority);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn read(x: i32, task_id: u64) -> ContainerJob {
    ContainerJob::Read {
      pos: TilePos::new(x, 0),
      task_id,
    }
  }

  #[test]
  fn raise_moves_only_matching_jobs() {
    let mut queue = ContainerQueue::default();
    queue.push(1, Priority::Normal, read(0, 1));
    queue.push(2, Priority::Low, read(1, 2));
    queue.push(3, Priority::Low, read(2, 3));
    queue.raise(TilePos::new(2, 0), Priority::Highest);

    assert_eq!(queue.head_priority(), Some(Priority::Highest));
    let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|j| j.pos().x)).collect();
    assert_eq!(order, vec![2, 0, 1]);
    assert!(queue.is_empty());
  }
}
