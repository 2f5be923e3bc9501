//! Typed entity layer over the data store.
//!
//! Entities are full-snapshot revision records plus the secondary
//! indices and the revision log that make replay and live queries
//! possible. The write path is owned by the pipeline; everything else
//! reads through snapshots.

pub mod store;
pub mod types;

pub use store::{EntityReader, EntityStore};
pub use types::{Entity, EntityMetadata, TypeCapabilities, TypeRegistry};
