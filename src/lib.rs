//!
//! blobsync
//! --------
//! Directory synchronization over a self-verifying blob store. The crate
//! splits into the storage engine (`blob`, `storage`), the HTTP surface
//! (`server`, `client`) and the reconciler that drives push and pull
//! (`sync`), with `types` and `error` shared across all of them.

pub mod blob;
pub mod client;
pub mod config;
pub mod error;
pub mod hash;
pub mod server;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
