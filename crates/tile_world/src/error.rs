//! Error types.
//!
//! Errors are grouped by who observes them:
//! - [`StorageError`]: backing container failures
//! - [`IoError`]: results handed to I/O controller callers
//! - [`StageError`]: a stage function or tile load failed
//! - [`RequestError`]: delivered to status request waiters
//! - [`TicketError`]: rejected ticket operations
//! - [`FatalError`]: invariant violations and shutdown data loss
//! - [`OpenError`]: constructing a tile world failed

use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};
use std::{fmt, io};

use bevy::log::error;

use crate::coords::{ContainerPos, TilePos};
use crate::status::ContentStatus;
use crate::storage::Channel;

/// Error type for backing container operations.
#[derive(Debug)]
pub enum StorageError {
  /// Standard I/O error.
  Io(io::Error),
  /// Container contents failed validation.
  Corrupt {
    container: ContainerPos,
    reason: String,
  },
  /// Storage was closed.
  Closed,
}

impl fmt::Display for StorageError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(e) => write!(f, "I/O error: {e}"),
      Self::Corrupt { container, reason } => write!(f, "corrupt container {container}: {reason}"),
      Self::Closed => write!(f, "storage closed"),
    }
  }
}

impl Error for StorageError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      Self::Io(e) => Some(e),
      Self::Corrupt { .. } | Self::Closed => None,
    }
  }
}

impl From<io::Error> for StorageError {
  fn from(err: io::Error) -> Self {
    Self::Io(err)
  }
}

/// Error delivered to readers of the I/O controller.
#[derive(Debug, Clone)]
pub enum IoError {
  /// The backing storage failed.
  Storage {
    channel: Channel,
    pos: TilePos,
    message: String,
  },
  /// Stored bytes could not be decompressed.
  Decompress {
    channel: Channel,
    pos: TilePos,
    reason: String,
  },
  /// The controller no longer accepts work.
  Shutdown { channel: Channel },
}

impl fmt::Display for IoError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Storage {
        channel,
        pos,
        message,
      } => write!(f, "{channel} storage failure at {pos}: {message}"),
      Self::Decompress {
        channel,
        pos,
        reason,
      } => write!(f, "failed to decompress {channel} data at {pos}: {reason}"),
      Self::Shutdown { channel } => write!(f, "{channel} controller is shut down"),
    }
  }
}

impl Error for IoError {}

/// A stage function or load failed for a tile.
#[derive(Debug, Clone)]
pub enum StageError {
  /// The stage function returned an error or panicked.
  Generator {
    pos: TilePos,
    status: ContentStatus,
    message: String,
  },
  /// Persisted data could not be decoded.
  Decode {
    pos: TilePos,
    channel: Channel,
    reason: String,
  },
  /// Reading persisted data failed.
  Io(IoError),
  /// A neighbour this stage depends on failed permanently.
  Dependency { pos: TilePos, neighbour: TilePos },
}

impl fmt::Display for StageError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Generator {
        pos,
        status,
        message,
      } => write!(f, "stage {status} failed for tile {pos}: {message}"),
      Self::Decode {
        pos,
        channel,
        reason,
      } => write!(f, "failed to decode {channel} data for tile {pos}: {reason}"),
      Self::Io(e) => write!(f, "{e}"),
      Self::Dependency { pos, neighbour } => {
        write!(f, "tile {pos} depends on failed neighbour {neighbour}")
      }
    }
  }
}

impl Error for StageError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      Self::Io(e) => Some(e),
      _ => None,
    }
  }
}

impl From<IoError> for StageError {
  fn from(err: IoError) -> Self {
    Self::Io(err)
  }
}

/// Failure delivered to a status request.
#[derive(Debug, Clone)]
pub enum RequestError {
  /// The tile world is closed or closing.
  Closed,
  /// The tile cannot reach the requested status.
  StageFailed {
    pos: TilePos,
    status: ContentStatus,
    cause: StageError,
  },
  /// The request was cancelled by its owner.
  Cancelled,
  /// The tile world stopped on an unrecoverable error.
  Fatal(String),
}

impl fmt::Display for RequestError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Closed => write!(f, "tile world is closed"),
      Self::StageFailed { pos, status, cause } => {
        write!(f, "tile {pos} cannot reach {status}: {cause}")
      }
      Self::Cancelled => write!(f, "request cancelled"),
      Self::Fatal(msg) => write!(f, "fatal tile world error: {msg}"),
    }
  }
}

impl Error for RequestError {}

impl From<TicketError> for RequestError {
  fn from(err: TicketError) -> Self {
    match err {
      TicketError::Closed => Self::Closed,
      TicketError::LevelOutOfRange { level } => {
        Self::Fatal(format!("request ticket level {level} out of range"))
      }
    }
  }
}

impl From<FatalError> for RequestError {
  fn from(err: FatalError) -> Self {
    Self::Fatal(err.to_string())
  }
}

/// Rejected ticket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketError {
  /// The registry was closed; no new tickets are accepted.
  Closed,
  /// Level is at or above the unloaded level.
  LevelOutOfRange { level: u8 },
}

impl fmt::Display for TicketError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Closed => write!(f, "ticket registry is closed"),
      Self::LevelOutOfRange { level } => write!(f, "ticket level {level} is out of range"),
    }
  }
}

impl Error for TicketError {}

/// Unrecoverable failure. The owning loop must stop.
#[derive(Debug, Clone)]
pub enum FatalError {
  /// An internal invariant was violated.
  Invariant {
    what: &'static str,
    context: Vec<(&'static str, String)>,
  },
  /// Data could not be flushed during shutdown.
  ShutdownFlush { failures: Vec<(Channel, TilePos)> },
}

impl FatalError {
  /// Builds an invariant violation with key/value context.
  pub fn invariant(what: &'static str, context: Vec<(&'static str, String)>) -> Self {
    Self::Invariant { what, context }
  }
}

impl fmt::Display for FatalError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Invariant { what, context } => {
        write!(f, "invariant violated: {what}")?;
        for (key, value) in context {
          write!(f, "; {key}: {value}")?;
        }
        Ok(())
      }
      Self::ShutdownFlush { failures } => {
        write!(f, "{} writes could not be flushed during shutdown", failures.len())?;
        for (channel, pos) in failures.iter().take(8) {
          write!(f, "; {channel} {pos}")?;
        }
        Ok(())
      }
    }
  }
}

impl Error for FatalError {}

/// Shared slot where worker threads park the first fatal error.
///
/// The authoritative loop takes it on its next tick and stops.
#[derive(Clone, Default)]
pub struct FaultSlot {
  inner: Arc<Mutex<Option<FatalError>>>,
}

impl FaultSlot {
  /// Records `err` unless an earlier fault is already parked.
  pub fn record(&self, err: FatalError) {
    error!("{err}");
    let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
      *slot = Some(err);
    }
  }

  /// The parked fault, left in place.
  pub fn get(&self) -> Option<FatalError> {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn take(&self) -> Option<FatalError> {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
  }

  pub fn is_set(&self) -> bool {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }
}

/// Failure to construct a tile world.
#[derive(Debug)]
pub enum OpenError {
  Storage(StorageError),
  ThreadPool(rayon::ThreadPoolBuildError),
}

impl fmt::Display for OpenError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Storage(e) => write!(f, "failed to open storage: {e}"),
      Self::ThreadPool(e) => write!(f, "failed to start thread pool: {e}"),
    }
  }
}

impl Error for OpenError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      Self::Storage(e) => Some(e),
      Self::ThreadPool(e) => Some(e),
    }
  }
}

impl From<StorageError> for OpenError {
  fn from(err: StorageError) -> Self {
    Self::Storage(err)
  }
}

impl From<rayon::ThreadPoolBuildError> for OpenError {
  fn from(err: rayon::ThreadPoolBuildError) -> Self {
    Self::ThreadPool(err)
  }
}
