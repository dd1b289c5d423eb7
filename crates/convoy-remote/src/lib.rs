//! Remote backend contract and implementations.
//!
//! The core never talks to a concrete backend directly; it consumes the
//! `RemoteStore` trait. Two backends are provided:
//!   - **memory**: full in-process loopback (tables + event fan-out), used by
//!     tests and by `convoyd --remote memory` during development.
//!   - **rest**: HTTP backend — row CRUD under `/rest/{table}`, RPC under
//!     `/rpc/{name}`, and a server-sent-events change feed at `/changes`.

pub mod memory;
pub mod rest;
pub mod store;

pub use memory::MemoryRemote;
pub use rest::RestRemote;
pub use store::{ChangeSession, RecordMatch, RemoteStore};
