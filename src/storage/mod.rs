//! Storage layer: the transactional ordered KV store.
//!
//! The storage layer knows nothing about entities. It provides named
//! sub-databases inside one redb file, snapshot readers, a single
//! serialized writer, ordered scans, and the key-encoding helpers the
//! typed layers build on.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  EntityStore / CommandQueue / RemoteIdMap    │
//! │                     │                        │
//! │                     ▼                        │
//! │        DataStore (one per redb file)         │
//! │        ReadTxn (snapshot) / WriteTxn         │
//! └──────────────────────────────────────────────┘
//! ```

pub mod redb;
pub mod schema;

pub use self::redb::{DataStore, ReadTxn, TreeStat, WriteTxn};
pub use schema::{RevisionLogEntry, StoreMetadata, SCHEMA_VERSION};
