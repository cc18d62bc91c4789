//! Locking core for a WebDAV server (RFC 4918 §§6-10).
//!
//! This crate implements lock acquisition, refresh, release, enumeration,
//! `If` header evaluation, and hierarchical scope comparison as a
//! storage-agnostic library: it talks to a pluggable [`backend::LockBackend`]
//! rather than owning a filesystem itself, so it can sit in front of any
//! `DavFileSystem`-shaped implementation.
//!
//! The entry point is [`manager::LockManager`], built via
//! [`manager::LockManager::builder`].

#[macro_use]
extern crate log;

pub mod backend;
pub mod clock;
pub mod cleanup;
pub mod conditional;
pub mod conflict;
pub mod errors;
pub mod events;
pub mod filesystem;
pub mod lock;
pub mod manager;
pub mod memory;
pub mod webpath;

pub use backend::{BackendFuture, LockBackend, LockTransaction};
pub use cleanup::{CleanupActor, ExpiryHandler};
pub use clock::{Clock, RoundingPolicy, SystemClock, TestClock};
pub use conditional::{IfCondition, IfHeader, IfList, IfParseError};
pub use errors::{LockError, LockResult};
pub use events::{EventChannel, LockEvent};
pub use filesystem::ResourceStore;
pub use lock::{ActiveLock, LockAccessType, LockShareMode, LockStatus, PathInfo};
pub use manager::{ImplicitLock, LockManager, LockManagerBuilder};
pub use memory::{MemoryBackend, MemoryTransaction, NullBackend};
pub use tokio_util::sync::CancellationToken;
pub use webpath::{LockPath, PathParseError, PathRelation};
