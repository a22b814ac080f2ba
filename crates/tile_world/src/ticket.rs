//! Interest tokens ("tickets") and their thread-safe registry.
//!
//! Tickets can be added and removed from any thread. The registry only
//! records which coordinates changed; the tile manager applies the new
//! minimum levels to the propagator during its tick.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::coords::TilePos;
use crate::error::TicketError;
use crate::status;

/// Source of a ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TicketKind {
  /// Spawn area kept loaded for the world's lifetime.
  Start,
  /// Explicit keep-alive region.
  Forced,
  /// Area around a connected viewer.
  Viewer,
  /// Transient ticket backing a single status request.
  Request,
  /// Keeps a tile one extra tick after its level was raised.
  Unknown,
  /// Keeps a tile resident after an unload attempt failed.
  UnloadCooldown,
  /// Application-defined source.
  Custom(&'static str),
}

impl fmt::Display for TicketKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Start => f.write_str("start"),
      Self::Forced => f.write_str("forced"),
      Self::Viewer => f.write_str("viewer"),
      Self::Request => f.write_str("request"),
      Self::Unknown => f.write_str("unknown"),
      Self::UnloadCooldown => f.write_str("unload_cooldown"),
      Self::Custom(name) => f.write_str(name),
    }
  }
}

/// Key identifying who owns a ticket. Used for bulk removal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketOwner(pub u64);

/// An interest token at a coordinate.
///
/// The level is fixed for the lifetime of the ticket; changing interest
/// means removing the ticket and adding a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
  pub kind: TicketKind,
  pub level: u8,
  pub owner: TicketOwner,
  /// Tick at which the ticket expires, if it has a timeout.
  pub expires_at: Option<u64>,
}

impl Ticket {
  fn matches(&self, kind: TicketKind, level: u8, owner: TicketOwner) -> bool {
    self.kind == kind && self.level == level && self.owner == owner
  }
}

#[derive(Default)]
struct TicketState {
  tickets: HashMap<TilePos, Vec<Ticket>>,
  dirty: HashSet<TilePos>,
  current_tick: u64,
  closed: bool,
}

impl TicketState {
  fn min_level(&self, pos: TilePos) -> Option<u8> {
    self.tickets.get(&pos)?.iter().map(|t| t.level).min()
  }

  fn remove_where(&mut self, pos: TilePos, mut pred: impl FnMut(&Ticket) -> bool) -> usize {
    let before = self.min_level(pos);
    let Some(list) = self.tickets.get_mut(&pos) else {
      return 0;
    };
    let len = list.len();
    list.retain(|t| !pred(t));
    let removed = len - list.len();
    if removed == 0 {
      return 0;
    }
    if list.is_empty() {
      self.tickets.remove(&pos);
    }
    self.dirty.insert(pos);

    // Delay the level increase by one tick so the tile is not dropped while
    // callers are still reacting to the completion that released it.
    let after = self.min_level(pos);
    if let Some(old) = before
      && after.is_none_or(|new| new > old)
      && !self.closed
    {
      let delay = Ticket {
        kind: TicketKind::Unknown,
        level: old,
        owner: TicketOwner::default(),
        expires_at: Some(self.current_tick + 1),
      };
      self.tickets.entry(pos).or_default().push(delay);
    }
    removed
  }
}

/// Thread-safe ticket storage.
///
/// Shared between the tile manager and any number of producers.
pub struct TicketRegistry {
  state: Mutex<TicketState>,
  next_owner: AtomicU64,
}

impl Default for TicketRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl TicketRegistry {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(TicketState::default()),
      next_owner: AtomicU64::new(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, TicketState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Allocates a fresh owner key for transient tickets.
  ///
  /// Keys are drawn from the high half of the key space so they never collide
  /// with small hand-picked owner ids.
  pub fn allocate_owner(&self) -> TicketOwner {
    TicketOwner((1 << 63) | self.next_owner.fetch_add(1, Ordering::Relaxed))
  }

  /// Adds a ticket. Returns false if an identical ticket already existed
  /// (its timeout is refreshed).
  pub fn add(
    &self,
    pos: TilePos,
    kind: TicketKind,
    level: u8,
    owner: TicketOwner,
    timeout_ticks: Option<u64>,
  ) -> Result<bool, TicketError> {
    if level >= status::unloaded_level() {
      return Err(TicketError::LevelOutOfRange { level });
    }
    let mut state = self.lock();
    if state.closed {
      return Err(TicketError::Closed);
    }
    let expires_at = timeout_ticks.map(|t| state.current_tick + t.max(1));
    let list = state.tickets.entry(pos).or_default();
    if let Some(existing) = list.iter_mut().find(|t| t.matches(kind, level, owner)) {
      existing.expires_at = expires_at;
      return Ok(false);
    }
    list.push(Ticket {
      kind,
      level,
      owner,
      expires_at,
    });
    state.dirty.insert(pos);
    Ok(true)
  }

  /// Removes one matching ticket. Returns whether it existed.
  pub fn remove(&self, pos: TilePos, kind: TicketKind, level: u8, owner: TicketOwner) -> bool {
    let mut state = self.lock();
    let mut found = false;
    state.remove_where(pos, |t| {
      if !found && t.matches(kind, level, owner) {
        found = true;
        return true;
      }
      false
    }) > 0
  }

  /// Removes every ticket of `kind` held by `owner`, at any coordinate.
  pub fn remove_all_for(&self, kind: TicketKind, owner: TicketOwner) -> usize {
    self.remove_matching(|t| t.kind == kind && t.owner == owner)
  }

  /// Removes every ticket held by `owner`, regardless of kind.
  pub fn remove_by_owner(&self, owner: TicketOwner) -> usize {
    self.remove_matching(|t| t.owner == owner)
  }

  fn remove_matching(&self, pred: impl Fn(&Ticket) -> bool) -> usize {
    let mut state = self.lock();
    let positions: Vec<TilePos> = state
      .tickets
      .iter()
      .filter(|(_, list)| list.iter().any(&pred))
      .map(|(pos, _)| *pos)
      .collect();
    positions
      .into_iter()
      .map(|pos| state.remove_where(pos, &pred))
      .sum()
  }

  /// Advances the registry clock and drops expired tickets.
  pub fn advance(&self, tick: u64) -> usize {
    let mut state = self.lock();
    state.current_tick = tick;
    let mut expired = 0;
    let mut emptied = Vec::new();
    let TicketState { tickets, dirty, .. } = &mut *state;
    for (pos, list) in tickets.iter_mut() {
      let len = list.len();
      list.retain(|t| t.expires_at.is_none_or(|at| at > tick));
      if list.len() != len {
        expired += len - list.len();
        dirty.insert(*pos);
      }
      if list.is_empty() {
        emptied.push(*pos);
      }
    }
    for pos in emptied {
      tickets.remove(&pos);
    }
    expired
  }

  /// Takes the coordinates whose minimum level may have changed, with that
  /// minimum (None when no tickets remain).
  pub fn take_dirty(&self) -> Vec<(TilePos, Option<u8>)> {
    let mut state = self.lock();
    let dirty: Vec<TilePos> = state.dirty.drain().collect();
    dirty
      .into_iter()
      .map(|pos| (pos, state.min_level(pos)))
      .collect()
  }

  /// Returns true if changes are waiting to be applied.
  pub fn has_dirty(&self) -> bool {
    !self.lock().dirty.is_empty()
  }

  /// Minimum ticket level at `pos`.
  pub fn min_level(&self, pos: TilePos) -> Option<u8> {
    self.lock().min_level(pos)
  }

  /// Snapshot of the tickets at `pos`.
  pub fn tickets_at(&self, pos: TilePos) -> Vec<Ticket> {
    self.lock().tickets.get(&pos).cloned().unwrap_or_default()
  }

  /// Total number of tickets.
  pub fn len(&self) -> usize {
    self.lock().tickets.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Rejects further additions and drops every ticket.
  pub fn close(&self) {
    let mut state = self.lock();
    state.closed = true;
    let positions: Vec<TilePos> = state.tickets.keys().copied().collect();
    state.dirty.extend(positions);
    state.tickets.clear();
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const POS: TilePos = TilePos::new(4, -7);

  #[test]
  fn minimum_level_wins() {
    let registry = TicketRegistry::new();
    registry.add(POS, TicketKind::Forced, 30, TicketOwner(1), None).unwrap();
    registry.add(POS, TicketKind::Viewer, 25, TicketOwner(2), None).unwrap();
    assert_eq!(registry.take_dirty(), vec![(POS, Some(25))]);
    assert!(registry.take_dirty().is_empty());
  }

  #[test]
  fn duplicate_add_is_not_counted_twice() {
    let registry = TicketRegistry::new();
    assert!(registry.add(POS, TicketKind::Forced, 30, TicketOwner(1), None).unwrap());
    assert!(!registry.add(POS, TicketKind::Forced, 30, TicketOwner(1), None).unwrap());
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn removal_that_raises_level_is_delayed_one_tick() {
    let registry = TicketRegistry::new();
    registry.advance(10);
    registry.add(POS, TicketKind::Forced, 30, TicketOwner(1), None).unwrap();
    assert!(registry.remove(POS, TicketKind::Forced, 30, TicketOwner(1)));

    let delayed = registry.tickets_at(POS);
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].kind, TicketKind::Unknown);
    assert_eq!(registry.min_level(POS), Some(30));

    registry.advance(11);
    assert_eq!(registry.min_level(POS), None);
    assert!(registry.is_empty());
  }

  #[test]
  fn removal_under_a_lower_ticket_is_immediate() {
    let registry = TicketRegistry::new();
    registry.add(POS, TicketKind::Forced, 20, TicketOwner(1), None).unwrap();
    registry.add(POS, TicketKind::Viewer, 30, TicketOwner(2), None).unwrap();
    registry.remove(POS, TicketKind::Viewer, 30, TicketOwner(2));
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn bulk_removal_by_owner() {
    let registry = TicketRegistry::new();
    let owner = registry.allocate_owner();
    for x in 0..5 {
      registry
        .add(TilePos::new(x, 0), TicketKind::Request, 33, owner, None)
        .unwrap();
    }
    registry.add(TilePos::new(0, 0), TicketKind::Forced, 33, TicketOwner(9), None).unwrap();
    assert_eq!(registry.remove_all_for(TicketKind::Request, owner), 5);
    assert_eq!(registry.remove_by_owner(owner), 0);
    assert_eq!(registry.min_level(TilePos::new(0, 0)), Some(33));
  }

  #[test]
  fn timeouts_expire_on_advance() {
    let registry = TicketRegistry::new();
    registry.add(POS, TicketKind::UnloadCooldown, 40, TicketOwner(0), Some(5)).unwrap();
    registry.take_dirty();
    assert_eq!(registry.advance(4), 0);
    assert_eq!(registry.advance(5), 1);
    assert_eq!(registry.take_dirty(), vec![(POS, None)]);
  }

  #[test]
  fn closed_registry_rejects_and_clears() {
    let registry = TicketRegistry::new();
    registry.add(POS, TicketKind::Start, 22, TicketOwner(0), None).unwrap();
    registry.close();
    assert!(registry.is_empty());
    assert_eq!(
      registry.add(POS, TicketKind::Start, 22, TicketOwner(0), None),
      Err(TicketError::Closed)
    );
    assert_eq!(registry.take_dirty(), vec![(POS, None)]);
  }

  #[test]
  fn unloaded_level_is_rejected() {
    let registry = TicketRegistry::new();
    let level = status::unloaded_level();
    assert_eq!(
      registry.add(POS, TicketKind::Forced, level, TicketOwner(0), None),
      Err(TicketError::LevelOutOfRange { level })
    );
  }
}
