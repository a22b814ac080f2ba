//! Tile World - tile lifecycle management for infinite worlds.
//!
//! Tiles are kept resident by interest tokens ([tickets](ticket)). Ticket
//! levels spread across the grid through the [`propagator`]; each resident
//! tile's level decides how far its content is generated and whether it
//! ticks. The [`TileManager`] drives tiles through the generation stages in
//! dependency order, persists them through per-channel [`io`] controllers and
//! unloads them once nothing needs them.
//!
//! Use [`TileWorldPlugin`] to run a world inside a Bevy app, or drive a
//! [`TileManager`] directly by calling [`TileManager::tick`].

pub mod config;
pub mod content;
pub mod coords;
pub mod error;
pub mod executor;
pub mod generator;
pub mod holder;
pub mod io;
pub mod manager;
pub mod plugin;
pub mod propagator;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod ticket;

pub use config::{TileWorldConfig, default_save_dir};
pub use content::{EntityRecord, Marker, TILE_EDGE, TileContent};
pub use coords::{ContainerPos, TilePos};
pub use error::{FatalError, IoError, OpenError, RequestError, StageError, TicketError};
pub use executor::Priority;
pub use generator::{FlatGenerator, StageContext, StageGenerator};
pub use holder::{HolderState, TileHolder, UnloadBlocker};
pub use manager::{FullStatusChange, SaveStats, TileManager};
pub use plugin::{TileFullStatusChanged, TileViewer, TileWorld, TileWorldPlugin};
pub use scheduler::StatusRequest;
pub use status::{ContentStatus, FullStatus};
pub use storage::Channel;
pub use ticket::{TicketKind, TicketOwner};
