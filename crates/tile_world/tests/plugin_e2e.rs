//! E2E test for the Bevy plugin.
//!
//! A viewer entity walks across the world: its tiles must become ticking,
//! full status changes must arrive as messages, tiles left behind must
//! unload, and app exit must close the world.
//!
//! Run: cargo test -p tile_world --test plugin_e2e

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bevy::app::{TaskPoolOptions, TaskPoolPlugin};
use bevy::prelude::*;
use tile_world::{
  FlatGenerator, FullStatus, TileFullStatusChanged, TilePos, TileViewer, TileWorld,
  TileWorldConfig, TileWorldPlugin,
};

const TIMEOUT: Duration = Duration::from_secs(30);
const TILE_SIZE: f32 = 16.0;

#[derive(Resource, Default)]
struct ChangeLog(Vec<TileFullStatusChanged>);

fn record_changes(mut reader: MessageReader<TileFullStatusChanged>, mut log: ResMut<ChangeLog>) {
  log.0.extend(reader.read().copied());
}

struct TestHarness {
  app: App,
  viewer: Entity,
}

impl TestHarness {
  fn new() -> Self {
    let mut app = App::new();
    app.add_plugins(MinimalPlugins.set(TaskPoolPlugin {
      task_pool_options: TaskPoolOptions::with_num_threads(4),
    }));
    app.add_plugins(
      TileWorldPlugin::in_memory(Arc::new(FlatGenerator::new(11))).config(TileWorldConfig {
        worker_threads: 2,
        io_threads: 2,
        tile_size: TILE_SIZE,
        unload_min_per_tick: 500,
        ..Default::default()
      }),
    );
    app.init_resource::<ChangeLog>();
    app.add_systems(Update, record_changes);

    let viewer = app
      .world_mut()
      .spawn((
        Transform::from_xyz(TILE_SIZE * 0.5, 0.0, TILE_SIZE * 0.5),
        TileViewer { radius: 1 },
      ))
      .id();
    app.update();

    Self { app, viewer }
  }

  fn world(&self) -> &TileWorld {
    self.app.world().resource::<TileWorld>()
  }

  fn run_until(&mut self, what: &str, done: impl Fn(&TileWorld) -> bool) {
    let started = Instant::now();
    while !done(self.world()) {
      assert!(started.elapsed() < TIMEOUT, "timed out waiting for {what}");
      self.app.update();
      thread::sleep(Duration::from_millis(1));
    }
  }

  fn move_viewer(&mut self, tile: TilePos) {
    let mut transform = self
      .app
      .world_mut()
      .get_mut::<Transform>(self.viewer)
      .expect("viewer missing");
    transform.translation.x = (tile.x as f32 + 0.5) * TILE_SIZE;
    transform.translation.z = (tile.z as f32 + 0.5) * TILE_SIZE;
  }
}

#[test]
fn viewer_drives_loading_and_unloading() {
  let mut h = TestHarness::new();
  let origin = TilePos::new(0, 0);

  h.run_until("origin to tick", |w| {
    w.full_status(origin) == FullStatus::BlockTicking
  });
  // Radius 1 around the viewer is full, the ring beyond is not.
  assert_eq!(h.world().full_status(TilePos::new(1, 1)), FullStatus::Full);
  assert_eq!(
    h.world().full_status(TilePos::new(2, 0)),
    FullStatus::Inaccessible
  );
  h.app.update();
  let log = &h.app.world().resource::<ChangeLog>().0;
  assert!(
    log
      .iter()
      .any(|c| c.pos == origin && c.new == FullStatus::BlockTicking),
    "no ticking message for origin: {log:?}"
  );

  let far = TilePos::new(30, 0);
  h.move_viewer(far);
  h.run_until("viewer to move", |w| {
    w.holder(origin).is_none() && w.full_status(far) == FullStatus::BlockTicking
  });
  let log = &h.app.world().resource::<ChangeLog>().0;
  assert!(
    log
      .iter()
      .any(|c| c.pos == origin && c.new == FullStatus::Inaccessible)
  );

  h.app.world_mut().despawn(h.viewer);
  h.run_until("every tile to unload", |w| w.holder_count() == 0);

  h.app
    .world_mut()
    .resource_mut::<Messages<AppExit>>()
    .write(AppExit::Success);
  h.app.update();
  assert!(h.world().is_closed());
}
