//! replayd core library.
//!
//! This crate provides the foundational types for the replayd graphics-API
//! replay daemon.
//!
//! # Key components
//!
//! - **Arena**: a single pre-reserved address range, sized by probing a
//!   descending list of candidate sizes, that bounds pointer-like
//!   references used during interpretation
//! - **Cache**: resource caches (in-memory LRU and on-disk index/data
//!   pair) shared by every connection
//! - **Loader**: resource loading with optional caching or network
//!   pass-through
//! - **Context**: the VM-context lifecycle traits driven by the
//!   orchestrator (`initialize` / `prefetch` / `interpret` / `cleanup`)
//! - **Crash**: panic capture for postback to the controlling client

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod auth;
pub mod cache;
pub mod context;
pub mod crash;
pub mod error;
pub mod loader;
pub mod types;

pub use arena::MemoryArena;
pub use auth::AuthToken;
pub use cache::{InMemoryResourceCache, OnDiskResourceCache, ResourceCache};
pub use context::{ContextFactory, Interpreter, VmContext};
pub use crash::{CrashHandler, CrashReport};
pub use error::{ReplayError, Result};
pub use loader::{CachedLoader, PassThroughLoader, ResourceLoader, ResourceProvider};
pub use types::{InterpretMode, Resource, ResourceId, StateId};
