//! # Estuary
//!
//! A local personal-information-management data hub. Each *resource
//! instance* (one IMAP account, one CalDAV calendar, one Maildir
//! directory) runs as an independent worker process that owns a local
//! key-value database and talks to one remote source. Clients reach a
//! worker over a small local-socket protocol.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use estuary::{Config, Resource, ResourceContext};
//!
//! let context = ResourceContext::new("account1", "imap", "/var/lib/estuary", Config::default())?;
//! let resource = Resource::new(context, Box::new(my_source_adaptor))?;
//!
//! let local = tokio::task::LocalSet::new();
//! local.run_until(resource.run()).await?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! socket → listener → command queue → pipeline → entity store → revision
//!                                                     │
//!                       notification bus ◄────────────┘
//!                             │
//!        synchronizer ◄───────┴──► source adaptor (IMAP, CalDAV, ...)
//! ```
//!
//! - **Entity store** — a revisioned, append-only store of typed
//!   entities: every mutation writes a full snapshot record under a
//!   strictly monotonic per-instance revision, with secondary indices
//!   and a revision log for replay.
//! - **Pipeline** — the single writer: batches commands into one
//!   transaction, runs per-type preprocessors (mail header extraction,
//!   threading, special-purpose folders), and publishes one revision
//!   update per commit.
//! - **Query engine** — declarative queries with filtering, sorting,
//!   reduction (group-by with representatives and aggregates), thread
//!   expansion, and live update streams.
//! - **Synchronizer** — a cooperative scheduler interleaving remote
//!   sync, local change replay, inspections, and flush barriers against
//!   one source, with at-least-once delivery and crash recovery.
//!
//! ## Concurrency model
//!
//! Everything inside one worker runs single-threaded and cooperatively
//! on a tokio `LocalSet`; parallelism across resources comes from
//! running one process per instance. No suspension point is ever held
//! while a write transaction is open.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod context;
mod error;
mod listener;
mod resource;
mod secret;
mod types;
mod value;

pub mod entity;
pub mod notification;
pub mod pipeline;
pub mod protocol;
pub mod query;
pub mod queue;
pub mod storage;
pub mod sync;

// ============================================================================
// Public API re-exports
// ============================================================================

// Worker assembly
pub use context::ResourceContext;
pub use resource::Resource;

// Configuration
pub use config::Config;

// Error handling
pub use error::{Error, NotFoundError, Result, SourceError, StorageError};

// Core types
pub use types::{EntityId, EntityType, PropertyName, RemoteId, Revision, Timestamp};
pub use value::{PropertyMap, TypeSchema, Value, ValueKind};

// Entities
pub use entity::{Entity, EntityReader, EntityStore, TypeCapabilities, TypeRegistry};

// Write path
pub use pipeline::{Command, Pipeline, Preprocessor, ResourceMover};
pub use queue::{CommandQueue, FlushKind};

// Queries
pub use query::{Comparator, LiveQuery, Query, ResultEvent};

// Synchronization
pub use sync::{
    Inspection, InspectionKind, RemoteIdMap, SourceAdaptor, SyncRequest, SyncScope, SyncSession,
    Synchronizer,
};

// Notifications and secrets
pub use notification::{Notification, NotificationBus, NotificationKind, NotificationSubscription};
pub use secret::SecretStore;

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common Estuary usage.
///
/// ```rust
/// use estuary::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::ResourceContext;
    pub use crate::entity::{Entity, EntityStore, TypeRegistry};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::Command;
    pub use crate::query::{Comparator, Query};
    pub use crate::resource::Resource;
    pub use crate::sync::{SourceAdaptor, SyncScope};
    pub use crate::types::{EntityId, EntityType, Revision, Timestamp};
    pub use crate::value::{PropertyMap, Value};
}
