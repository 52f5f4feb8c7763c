//! Offline-first persistence and sync engine.
//!
//! Writes are queued durably and delivered by the sync processor once the
//! network is available; reads go through a TTL and version checked cache.
//! Every component shares one lazily opened [`store::Store`].

pub mod api;
pub mod cache;
pub mod capability;
pub mod config;
pub mod engine;
pub mod logging;
pub mod model;
pub mod queue;
pub mod status;
pub mod store;
pub mod sync;

pub use engine::{Engine, EngineSettings};
pub use model::{EnqueueOptions, Method, Mutation, Operation, Priority, QueueItem, ResourceType};
pub use status::{SyncState, SyncStats, SyncStatusRecord};
pub use store::Store;
pub use sync::{Connectivity, DrainOutcome, SyncReport};
