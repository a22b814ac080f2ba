//! E2E tests for the tile lifecycle.
//!
//! Drives a real [`TileManager`] (worker pools, I/O controllers, in-memory or
//! region file storage) through ticket changes and status requests, checking
//! dependency order, status monotonicity, failure handling, unload/reload,
//! cancellation, priorities, main-thread tasks, autosave, full status and
//! shutdown.
//!
//! Run: cargo test -p tile_world --test lifecycle_e2e

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tile_world::status::{
  BLOCK_TICKING_LEVEL, ENTITY_TICKING_LEVEL, FULL_LEVEL, level_for_status,
};
use tile_world::storage::{MemoryStorage, RegionStorage};
use tile_world::{
  Channel, ContentStatus, FlatGenerator, FullStatus, HolderState, Priority, RequestError,
  StageContext, StageGenerator, TicketError, TicketKind, TicketOwner, TileContent, TileManager,
  TilePos, TileWorldConfig,
};

const TIMEOUT: Duration = Duration::from_secs(30);

fn test_config() -> TileWorldConfig {
  TileWorldConfig {
    worker_threads: 2,
    io_threads: 2,
    unload_min_per_tick: 500,
    ..Default::default()
  }
}

/// Wraps [`FlatGenerator`] and counts stage runs per tile.
#[derive(Default)]
struct CountingGenerator {
  inner: FlatGenerator,
  runs: Mutex<HashMap<TilePos, usize>>,
}

impl CountingGenerator {
  fn runs(&self, pos: TilePos) -> usize {
    self.runs.lock().unwrap().get(&pos).copied().unwrap_or(0)
  }
}

impl StageGenerator for CountingGenerator {
  fn generate(
    &self,
    ctx: &StageContext<'_>,
    content: &mut TileContent,
  ) -> Result<(), Box<dyn Error + Send + Sync>> {
    *self.runs.lock().unwrap().entry(ctx.pos).or_default() += 1;
    self.inner.generate(ctx, content)
  }
}

/// Records every stage that ran without its inputs in place.
#[derive(Default)]
struct CheckingGenerator {
  inner: FlatGenerator,
  violations: Mutex<Vec<String>>,
}

impl StageGenerator for CheckingGenerator {
  fn generate(
    &self,
    ctx: &StageContext<'_>,
    content: &mut TileContent,
  ) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut violations = self.violations.lock().unwrap();
    if Some(content.status()) != ctx.status.prev() {
      violations.push(format!(
        "{} ran {} from {}",
        ctx.pos,
        ctx.status,
        content.status()
      ));
    }
    for radius in 1..=ctx.status.neighbour_radius() {
      let Some(required) = ctx.status.required_at(radius) else {
        continue;
      };
      for n in ctx.pos.square(radius) {
        if n.chebyshev(ctx.pos) != radius {
          continue;
        }
        let found = ctx.neighbour(n).map(TileContent::status);
        if found.is_none_or(|s| s < required) {
          violations.push(format!(
            "{} ran {} with {n} at {found:?}, needs {required}",
            ctx.pos, ctx.status
          ));
        }
      }
    }
    drop(violations);
    self.inner.generate(ctx, content)
  }
}

/// Fails one stage at one tile, every time.
struct FailingGenerator {
  pos: TilePos,
  status: ContentStatus,
  attempts: AtomicUsize,
}

impl StageGenerator for FailingGenerator {
  fn generate(
    &self,
    ctx: &StageContext<'_>,
    content: &mut TileContent,
  ) -> Result<(), Box<dyn Error + Send + Sync>> {
    if ctx.pos == self.pos && ctx.status == self.status {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      return Err("bedrock missing".into());
    }
    FlatGenerator::default().generate(ctx, content)
  }
}

/// Ticks the manager until `done` holds, checking that no resident tile's
/// status ever goes backwards.
struct Driver {
  manager: TileManager,
  seen: HashMap<TilePos, ContentStatus>,
}

impl Driver {
  fn new(manager: TileManager) -> Self {
    Self {
      manager,
      seen: HashMap::new(),
    }
  }

  fn tick(&mut self) {
    self.manager.tick().expect("tick failed");
    let manager = &self.manager;
    self.seen.retain(|pos, _| manager.holder(*pos).is_some());
    for pos in manager.resident() {
      let Some(status) = manager.status(pos) else {
        continue;
      };
      if let Some(previous) = self.seen.insert(pos, status) {
        assert!(status >= previous, "{pos} regressed from {previous} to {status}");
      }
    }
  }

  fn tick_until(&mut self, what: &str, mut done: impl FnMut(&TileManager) -> bool) {
    let started = Instant::now();
    while !done(&self.manager) {
      assert!(started.elapsed() < TIMEOUT, "timed out waiting for {what}");
      self.tick();
      thread::sleep(Duration::from_millis(1));
    }
  }
}

fn memory_storages() -> ([Arc<MemoryStorage>; 3], [Arc<dyn RegionStorage>; 3]) {
  let shift = test_config().group_shift;
  let memory = [
    Arc::new(MemoryStorage::new(shift)),
    Arc::new(MemoryStorage::new(shift)),
    Arc::new(MemoryStorage::new(shift)),
  ];
  let dyns = memory
    .clone()
    .map(|storage| storage as Arc<dyn RegionStorage>);
  (memory, dyns)
}

#[test]
fn token_loads_unloads_and_reloads_a_tile() {
  let (memory, storages) = memory_storages();
  let generator = Arc::new(CountingGenerator::default());
  let manager = TileManager::with_storage(test_config(), storages, generator.clone())
    .expect("open failed");
  let mut driver = Driver::new(manager);
  let origin = TilePos::new(0, 0);
  let owner = TicketOwner(1);

  driver
    .manager
    .add_interest_token(origin, FULL_LEVEL, owner)
    .expect("token rejected");
  driver.tick_until("origin to become full", |m| {
    m.status(origin) == Some(ContentStatus::Full)
  });

  let m = &driver.manager;
  assert_eq!(m.full_status(origin), FullStatus::Full);
  let neighbour = m.status(TilePos::new(1, 0)).expect("neighbour not resident");
  assert!(neighbour >= ContentStatus::InitializeLight);
  assert!(neighbour < ContentStatus::Full);
  assert_eq!(m.full_status(TilePos::new(1, 0)), FullStatus::Inaccessible);
  let snapshot = m
    .get_if_resident(origin, ContentStatus::Full)
    .expect("origin not resident");
  let generated = generator.runs(origin);
  assert_eq!(generated, ContentStatus::COUNT - 1);

  assert!(driver.manager.remove_interest_token(origin, FULL_LEVEL, owner));
  driver.tick_until("every tile to unload", |m| m.holder_count() == 0);
  assert!(driver.manager.io().flush().is_empty());
  assert!(memory[Channel::Tiles.index()].get(origin).is_some());
  let reads_before = memory[Channel::Tiles.index()].read_count();

  let request = driver
    .manager
    .request_status(origin, ContentStatus::Full, Priority::Normal);
  driver.tick_until("reload", |_| request.is_ready());
  let reloaded = request
    .try_take()
    .expect("no result")
    .expect("reload failed");
  assert_eq!(reloaded.status(), ContentStatus::Full);
  assert_eq!(reloaded.cells(), snapshot.cells());
  assert_eq!(reloaded.entities(), snapshot.entities());
  assert_eq!(generator.runs(origin), generated, "origin was regenerated");
  assert!(memory[Channel::Tiles.index()].read_count() > reads_before);

  driver.manager.close(true).expect("close failed");
}

#[test]
fn stages_only_run_with_dependencies_in_place() {
  let generator = Arc::new(CheckingGenerator::default());
  let manager = TileManager::in_memory(test_config(), generator.clone()).expect("open failed");
  let mut driver = Driver::new(manager);

  for (i, pos) in [TilePos::new(0, 0), TilePos::new(5, 3)].into_iter().enumerate() {
    driver
      .manager
      .add_interest_token(pos, FULL_LEVEL - 1, TicketOwner(i as u64 + 1))
      .expect("token rejected");
  }
  driver.tick_until("both areas to tick", |m| {
    m.full_status(TilePos::new(0, 0)) == FullStatus::BlockTicking
      && m.full_status(TilePos::new(5, 3)) == FullStatus::BlockTicking
  });

  let violations = generator.violations.lock().unwrap();
  assert!(violations.is_empty(), "violations: {violations:#?}");
  drop(violations);
  driver.manager.close(false).expect("close failed");
}

#[test]
fn lowering_interest_keeps_generated_content() {
  let manager =
    TileManager::in_memory(test_config(), Arc::new(FlatGenerator::new(3))).expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(-3, 8);
  let owner = TicketOwner(9);

  driver
    .manager
    .add_interest_token(pos, FULL_LEVEL, owner)
    .expect("token rejected");
  driver.tick_until("full", |m| m.status(pos) == Some(ContentStatus::Full));

  // Only the lesser ticket is left; content must not regress.
  let lesser = level_for_status(ContentStatus::Noise);
  driver
    .manager
    .add_interest_token(pos, lesser, owner)
    .expect("token rejected");
  driver.manager.remove_interest_token(pos, FULL_LEVEL, owner);
  for _ in 0..50 {
    driver.tick();
  }
  assert_eq!(driver.manager.status(pos), Some(ContentStatus::Full));
  assert_eq!(driver.manager.full_status(pos), FullStatus::Inaccessible);
  assert_eq!(driver.manager.level(pos), lesser);

  driver.manager.close(false).expect("close failed");
}

#[test]
fn repeated_stage_failure_fails_the_request() {
  let target = TilePos::new(5, 5);
  let generator = Arc::new(FailingGenerator {
    pos: target,
    status: ContentStatus::Biomes,
    attempts: AtomicUsize::new(0),
  });
  let manager = TileManager::in_memory(test_config(), generator.clone()).expect("open failed");
  let mut driver = Driver::new(manager);

  let request = driver
    .manager
    .request_status(target, ContentStatus::Full, Priority::High);
  driver.tick_until("request to fail", |_| request.is_ready());

  match request.try_take() {
    Some(Err(RequestError::StageFailed { pos, .. })) => assert_eq!(pos, target),
    other => panic!("expected a stage failure, got {other:?}"),
  }
  assert_eq!(generator.attempts.load(Ordering::SeqCst), 2);
  let holder = driver.manager.holder(target);
  assert!(holder.and_then(|h| h.last_error()).is_some());
  assert!(driver.manager.status(target) < Some(ContentStatus::Biomes));

  // Asking again reports the failure without another attempt.
  let again = driver
    .manager
    .request_status(target, ContentStatus::Biomes, Priority::High);
  assert!(matches!(
    again.try_take(),
    Some(Err(RequestError::StageFailed { .. }))
  ));
  assert_eq!(generator.attempts.load(Ordering::SeqCst), 2);

  driver.manager.close(false).expect("close failed");
}

#[test]
fn unwritten_data_survives_unload() {
  let (memory, storages) = memory_storages();
  let generator = Arc::new(CountingGenerator::default());
  let manager = TileManager::with_storage(test_config(), storages, generator.clone())
    .expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(2, -6);
  let tiles = &memory[Channel::Tiles.index()];
  tiles.set_fail_writes(true);

  let request = driver
    .manager
    .request_status(pos, ContentStatus::Full, Priority::Normal);
  driver.tick_until("full", |_| request.is_ready());
  let content = request.try_take().expect("no result").expect("request failed");
  let generated = generator.runs(pos);

  driver.tick_until("unload", |m| m.holder_count() == 0);
  driver.tick_until("failed write", |m| {
    m.io().get(Channel::Tiles).failed_keys().contains(&pos)
  });
  assert!(tiles.get(pos).is_none());

  // The pending payload serves the reload.
  let reloaded = driver
    .manager
    .load_sync(pos, ContentStatus::Full)
    .expect("reload failed");
  assert_eq!(reloaded.cells(), content.cells());
  assert_eq!(generator.runs(pos), generated);

  tiles.set_fail_writes(false);
  let stats = driver.manager.save_all(true);
  assert!(stats.unflushed.is_empty(), "{:?}", stats.unflushed);
  assert!(tiles.get(pos).is_some());
  driver.manager.close(true).expect("close failed");
}

#[test]
fn modified_tiles_persist_across_reopen() {
  let dir = TempDir::new().unwrap();
  let pos = TilePos::new(40, -40);

  let mut manager =
    TileManager::open(test_config(), dir.path(), Arc::new(FlatGenerator::new(1))).unwrap();
  manager
    .load_sync(pos, ContentStatus::Full)
    .expect("load failed");
  manager
    .modify(pos, |content| content.set_cell(1, 1, 0xbeef))
    .expect("tile busy");
  let stats = manager.save_all(true);
  assert!(stats.saved > 0);
  assert!(stats.unflushed.is_empty());
  assert_eq!(manager.save_all(false).saved, 0, "clean tiles were saved again");
  manager.close(true).expect("close failed");
  drop(manager);

  let mut manager =
    TileManager::open(test_config(), dir.path(), Arc::new(FlatGenerator::new(1))).unwrap();
  let content = manager
    .load_sync(pos, ContentStatus::Full)
    .expect("reload failed");
  assert_eq!(content.cell(1, 1), 0xbeef);
  assert_eq!(content.status(), ContentStatus::Full);
  manager.close(true).expect("close failed");
}

#[test]
fn close_drains_everything() {
  let manager =
    TileManager::in_memory(test_config(), Arc::new(FlatGenerator::new(5))).expect("open failed");
  let mut driver = Driver::new(manager);
  driver
    .manager
    .add_interest_token(TilePos::new(0, 0), FULL_LEVEL - 2, TicketOwner(1))
    .expect("token rejected");
  for _ in 0..5 {
    driver.tick();
  }
  let pending = driver
    .manager
    .request_status(TilePos::new(100, 100), ContentStatus::Full, Priority::Normal);

  let mut manager = driver.manager;
  manager.close(true).expect("close failed");
  assert!(manager.is_closed());
  assert_eq!(manager.holder_count(), 0);
  assert_eq!(manager.tasks_in_flight(), 0);
  assert_eq!(manager.io().in_flight(), 0);
  assert!(matches!(pending.try_take(), Some(Err(RequestError::Closed))));

  let late = manager.request_status(TilePos::new(0, 0), ContentStatus::Empty, Priority::Normal);
  assert!(matches!(late.try_take(), Some(Err(RequestError::Closed))));
  assert!(matches!(
    manager.add_interest_token(TilePos::new(0, 0), FULL_LEVEL, TicketOwner(1)),
    Err(TicketError::Closed)
  ));
  assert!(manager.close(true).is_ok());
}

#[test]
fn dropped_interest_withdraws_pending_loads() {
  let (memory, storages) = memory_storages();
  for storage in &memory {
    storage.set_read_delay(Duration::from_millis(500));
  }
  let manager = TileManager::with_storage(test_config(), storages, Arc::new(FlatGenerator::new(2)))
    .expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(7, 7);
  let level = level_for_status(ContentStatus::Empty);
  let owner = TicketOwner(4);

  driver
    .manager
    .add_interest_token(pos, level, owner)
    .expect("token rejected");
  driver.tick();
  assert_eq!(driver.manager.holder_state(pos), HolderState::Loading);

  assert!(driver.manager.remove_interest_token(pos, level, owner));
  driver.tick_until("holder to unload", |m| m.holder_count() == 0);
  // The reads are still sleeping; the holder did not wait for them.
  assert!(driver.manager.io().in_flight() > 0);

  driver.tick_until("reads to land", |m| m.io().in_flight() == 0);
  for _ in 0..10 {
    driver.tick();
  }
  assert_eq!(driver.manager.holder_count(), 0);

  for storage in &memory {
    storage.set_read_delay(Duration::ZERO);
  }
  let content = driver
    .manager
    .load_sync(pos, ContentStatus::Empty)
    .expect("reload failed");
  assert!(content.status() >= ContentStatus::Empty);
  driver.manager.close(false).expect("close failed");
}

#[test]
fn cancelled_request_leaves_other_waiters_alone() {
  let manager =
    TileManager::in_memory(test_config(), Arc::new(FlatGenerator::new(6))).expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(3, 3);

  let cancelled = driver
    .manager
    .request_status(pos, ContentStatus::Full, Priority::Normal);
  let kept = driver
    .manager
    .request_status(pos, ContentStatus::Full, Priority::Normal);
  assert!(driver.manager.cancel_request(&cancelled));
  assert!(matches!(
    cancelled.try_take(),
    Some(Err(RequestError::Cancelled))
  ));
  assert!(!driver.manager.cancel_request(&cancelled));

  driver.tick_until("remaining request", |_| kept.is_ready());
  let content = kept.try_take().expect("no result").expect("request failed");
  assert_eq!(content.status(), ContentStatus::Full);
  assert!(!driver.manager.cancel_request(&kept));

  // Neither request ticket survives, so the whole area goes away.
  driver.tick_until("area to unload", |m| m.holder_count() == 0);
  assert!(driver.manager.tickets().is_empty());
  driver.manager.close(false).expect("close failed");
}

#[test]
fn scheduled_status_needs_no_ticket() {
  let manager =
    TileManager::in_memory(test_config(), Arc::new(FlatGenerator::new(8))).expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(-20, 4);

  let request = driver
    .manager
    .schedule_to_status(pos, ContentStatus::Noise, Priority::Normal);
  assert!(driver.manager.tickets().tickets_at(pos).is_empty());
  assert!(driver.manager.holder(pos).is_some());

  driver.tick_until("scheduled status", |_| request.is_ready());
  let content = request.try_take().expect("no result").expect("request failed");
  assert_eq!(content.status(), ContentStatus::Noise);
  assert!(driver.manager.tickets().is_empty());

  driver.tick_until("unticketed tiles to unload", |m| m.holder_count() == 0);
  driver.manager.close(false).expect("close failed");
}

#[test]
fn priority_changes_reach_holders_and_neighbours() {
  let manager =
    TileManager::in_memory(test_config(), Arc::new(FlatGenerator::new(10))).expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(12, -12);
  let neighbour = TilePos::new(13, -12);

  // Unticketed, so every neighbour is created on demand by this tile.
  let request = driver
    .manager
    .schedule_to_status(pos, ContentStatus::Noise, Priority::Normal);
  driver.manager.raise_priority(pos, Priority::Highest);
  assert_eq!(
    driver.manager.holder(pos).map(|h| h.priority()),
    Some(Priority::Highest)
  );
  // Raising to something less urgent is a no-op.
  driver.manager.raise_priority(pos, Priority::Low);
  assert_eq!(
    driver.manager.holder(pos).map(|h| h.priority()),
    Some(Priority::Highest)
  );

  let mut inherited = false;
  driver.tick_until("urgent request", |m| {
    inherited |= m
      .holder(neighbour)
      .is_some_and(|h| h.priority() == Priority::Highest);
    request.is_ready()
  });
  assert!(request.try_take().expect("no result").is_ok());
  assert!(inherited, "neighbour never inherited the urgent priority");

  let other = TilePos::new(-40, 40);
  let pending = driver
    .manager
    .request_status(other, ContentStatus::Full, Priority::Normal);
  driver.manager.lower_priority(other, Priority::Low);
  assert_eq!(
    driver.manager.holder(other).map(|h| h.priority()),
    Some(Priority::Low)
  );
  // Lowering to something more urgent is a no-op.
  driver.manager.lower_priority(other, Priority::High);
  assert_eq!(
    driver.manager.holder(other).map(|h| h.priority()),
    Some(Priority::Low)
  );
  driver.tick_until("low priority request", |_| pending.is_ready());
  assert!(pending.try_take().expect("no result").is_ok());
  driver.manager.close(false).expect("close failed");
}

#[test]
fn main_tasks_can_wait_on_tiles() {
  let manager =
    TileManager::in_memory(test_config(), Arc::new(FlatGenerator::new(12))).expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(-9, 2);
  let outer = Arc::new(Mutex::new(None));
  let inner = Arc::new(Mutex::new(None));

  let (outer_slot, inner_slot) = (Arc::clone(&outer), Arc::clone(&inner));
  driver.manager.queue_main_task(
    move |m| {
      // Runs inside the wait below, one level deeper.
      m.queue_main_task(
        move |m| {
          *inner_slot.lock().unwrap() = Some(m.load_sync(pos, ContentStatus::Full));
        },
        Priority::Highest,
      );
      *outer_slot.lock().unwrap() = Some(m.load_sync(pos, ContentStatus::Noise));
    },
    Priority::High,
  );
  driver.tick_until("main task", |_| outer.lock().unwrap().is_some());

  let outer = outer.lock().unwrap().take().expect("outer result");
  let inner = inner.lock().unwrap().take().expect("inner task never ran");
  assert_eq!(inner.expect("inner load failed").status(), ContentStatus::Full);
  assert!(outer.expect("outer load failed").status() >= ContentStatus::Noise);
  assert_eq!(driver.manager.status(pos), Some(ContentStatus::Full));
  driver.manager.close(false).expect("close failed");
}

#[test]
fn full_tiles_are_autosaved() {
  let (memory, storages) = memory_storages();
  let config = TileWorldConfig {
    autosave_interval_ticks: 5,
    ..test_config()
  };
  let manager = TileManager::with_storage(config, storages, Arc::new(FlatGenerator::new(14)))
    .expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(6, 0);
  let tiles = &memory[Channel::Tiles.index()];

  driver
    .manager
    .add_interest_token(pos, FULL_LEVEL, TicketOwner(3))
    .expect("token rejected");
  driver.tick_until("full", |m| m.status(pos) == Some(ContentStatus::Full));
  driver.tick_until("first autosave", |m| {
    m.holder(pos).is_some_and(|h| !h.is_dirty())
  });
  assert!(driver.manager.io().flush().is_empty());
  let first = tiles.get(pos).expect("autosave never reached storage");

  driver
    .manager
    .modify(pos, |content| content.set_cell(2, 3, 0xbeef))
    .expect("tile busy");
  let modified_at = driver.manager.current_tick();
  driver.tick_until("second autosave", |m| {
    m.holder(pos).is_some_and(|h| !h.is_dirty())
  });
  assert!(driver.manager.current_tick() - modified_at <= 5);
  assert!(driver.manager.io().flush().is_empty());
  assert_ne!(tiles.get(pos).expect("tile vanished"), first);
  // Saved in place; the tile never left.
  assert_eq!(driver.manager.status(pos), Some(ContentStatus::Full));
  driver.manager.close(false).expect("close failed");
}

#[test]
fn ticking_follows_neighbour_content() {
  let manager =
    TileManager::in_memory(test_config(), Arc::new(FlatGenerator::new(16))).expect("open failed");
  let mut driver = Driver::new(manager);
  let origin = TilePos::new(0, 0);
  let owner = TicketOwner(2);

  driver
    .manager
    .add_interest_token(origin, ENTITY_TICKING_LEVEL, owner)
    .expect("token rejected");
  driver.tick_until("entity ticking", |m| {
    for pos in m.resident() {
      if m.full_status(pos) == FullStatus::Inaccessible {
        continue;
      }
      let radius = m.full_status(pos).required_radius();
      for n in pos.square(radius) {
        assert_eq!(
          m.status(n),
          Some(ContentStatus::Full),
          "{pos} is {:?} with {n} not full",
          m.full_status(pos)
        );
      }
    }
    m.full_status(origin) == FullStatus::EntityTicking
  });
  let m = &driver.manager;
  assert_eq!(m.full_status(TilePos::new(1, 1)), FullStatus::BlockTicking);
  assert_eq!(m.full_status(TilePos::new(2, 0)), FullStatus::Full);
  assert_eq!(m.full_status(TilePos::new(3, 0)), FullStatus::Inaccessible);

  // A weaker token caps the origin and drops the outer ring.
  driver
    .manager
    .add_interest_token(origin, BLOCK_TICKING_LEVEL, owner)
    .expect("token rejected");
  driver
    .manager
    .remove_interest_token(origin, ENTITY_TICKING_LEVEL, owner);
  driver.tick_until("block ticking", |m| {
    m.full_status(origin) == FullStatus::BlockTicking
  });
  assert_eq!(
    driver.manager.full_status(TilePos::new(1, 0)),
    FullStatus::Full
  );
  assert_eq!(
    driver.manager.full_status(TilePos::new(2, 0)),
    FullStatus::Inaccessible
  );
  driver.manager.drain_full_status_changes();

  // Releasing the area stops the origin ticking before anything unloads.
  driver
    .manager
    .remove_interest_token(origin, BLOCK_TICKING_LEVEL, owner);
  driver.tick_until("area to unload", |m| m.holder_count() == 0);
  let changes = driver.manager.drain_full_status_changes();
  let origin_change = changes
    .iter()
    .find(|c| c.pos == origin)
    .expect("no change for origin");
  assert_eq!(origin_change.old, FullStatus::BlockTicking);
  assert_eq!(origin_change.new, FullStatus::Inaccessible);
  driver.manager.close(false).expect("close failed");
}

#[test]
fn failed_unload_save_keeps_the_tile_on_cooldown() {
  let config = TileWorldConfig {
    unload_cooldown_ticks: 5,
    ..test_config()
  };
  let manager =
    TileManager::in_memory(config, Arc::new(FlatGenerator::new(18))).expect("open failed");
  let mut driver = Driver::new(manager);
  let pos = TilePos::new(0, 9);
  let owner = TicketOwner(6);

  driver
    .manager
    .add_interest_token(pos, FULL_LEVEL, owner)
    .expect("token rejected");
  driver.tick_until("area to settle", |m| {
    m.status(pos) == Some(ContentStatus::Full) && m.tasks_in_flight() == 0
  });

  // Every later tile save is rejected.
  driver.manager.io().get(Channel::Tiles).close();
  assert!(driver.manager.holder(pos).is_some_and(|h| h.is_dirty()));
  driver.manager.remove_interest_token(pos, FULL_LEVEL, owner);

  for _ in 0..20 {
    driver.tick();
    let tickets = driver.manager.tickets().tickets_at(pos);
    assert!(
      tickets.iter().any(|t| t.kind == TicketKind::UnloadCooldown),
      "no cooldown ticket: {tickets:?}"
    );
  }
  assert!(driver.manager.holder(pos).is_some_and(|h| h.is_dirty()));
  driver.manager.close(false).expect("close failed");
}
