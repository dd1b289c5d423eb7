//! convoy sync core.
//!
//! The pieces, leaves first: a `NetworkMonitor` (connectivity transitions),
//! a `PersistentStore` (durable key/value blobs), a `SyncQueue` (bounded,
//! persisted FIFO of pending local mutations), a merge `PolicyTable`
//! (per-field conflict resolution), a `ChangeMultiplexer` (one realtime
//! session fanned out to per-topic listeners), a `SyncCoordinator`
//! (push/pull orchestration) and a `ServiceRegistry` (lazy, single-flight
//! service initialization).

pub mod coordinator;
pub mod local;
pub mod merge;
pub mod monitor;
pub mod mux;
pub mod persist;
pub mod queue;
pub mod services;

pub use coordinator::{SyncCoordinator, SyncReport};
pub use local::{LocalStore, MemoryLocalStore};
pub use merge::{FieldPolicy, PolicyTable, TieBreak};
pub use monitor::NetworkMonitor;
pub use mux::{ChangeMultiplexer, MuxState, Subscription};
pub use persist::{JsonFileStore, MemoryStore, PersistentStore};
pub use queue::{QueueOutcome, SyncQueue};
pub use services::ServiceRegistry;
