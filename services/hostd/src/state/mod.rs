//! Durable state persistence for the host daemon.
//!
//! A single JSON document holds the full node map and the free-port list.
//! It is rewritten atomically after every mutation and loaded at startup,
//! where stale running nodes are demoted before requests are served.

mod store;

pub use store::{PersistedState, StateStore, StoreError};
