//! Persistent class state
//!
//! Soft classes can outlive the process: they are written to a state
//! store with an expiry timestamp and re-materialized on the next run.
//! The store itself is a pluggable trait; the context only speaks the
//! record format.

pub mod store;

pub use store::{FileStore, MemoryStore, PersistEntry, StatePolicy, StateStore, StoreError};
