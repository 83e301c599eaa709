//! # vmlab-id
//!
//! Stable node identifiers for the vmlab host service.
//!
//! ## Design Principles
//!
//! - IDs are system-generated at node creation and immutable afterwards
//! - IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//!
//! ## ID Format
//!
//! Node IDs use a prefixed format: `node_{ulid}`
//!
//! Example: `node_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! This format provides:
//! - Sortability (ULID is time-ordered)
//! - Uniqueness (ULID has 80 bits of randomness)
//! - Human readability (a clear prefix)

mod error;
mod types;

pub use error::IdError;
pub use types::NodeId;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
