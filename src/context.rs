//! The process-level resource context.
//!
//! All collaborators a worker needs — instance identity, paths, the type
//! registry, the secret store, configuration — are constructed once at
//! startup and passed through this struct. There is no global state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::entity::TypeRegistry;
use crate::error::Result;
use crate::secret::SecretStore;

/// Identity and collaborators of one resource instance.
#[derive(Clone, Debug)]
pub struct ResourceContext {
    /// Unique instance identifier (e.g. `org.estuary.imap.account1`).
    pub instance_id: String,
    /// Resource type (e.g. `imap`, `caldav`, `maildir`).
    pub resource_type: String,
    /// Directory holding the two stores, the blob dir, socket, and lock.
    pub instance_dir: PathBuf,
    /// The entity type registry.
    pub registry: Arc<TypeRegistry>,
    /// Process-wide secret store.
    pub secrets: SecretStore,
    /// Behavior knobs.
    pub config: Config,
}

impl ResourceContext {
    /// Builds a context rooted under `base_dir/<instance_id>` with the
    /// standard PIM type registry.
    pub fn new(
        instance_id: impl Into<String>,
        resource_type: impl Into<String>,
        base_dir: impl AsRef<Path>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let instance_id = instance_id.into();
        Ok(Self {
            instance_dir: base_dir.as_ref().join(&instance_id),
            instance_id,
            resource_type: resource_type.into(),
            registry: TypeRegistry::standard(),
            secrets: SecretStore::new(),
            config,
        })
    }

    /// Replaces the type registry (for resources with custom types).
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Shares an existing secret store (one per process, many
    /// resources).
    pub fn with_secrets(mut self, secrets: SecretStore) -> Self {
        self.secrets = secrets;
        self
    }

    /// Path of the local socket clients connect to.
    pub fn socket_path(&self) -> PathBuf {
        self.instance_dir.join("socket")
    }

    /// Path of the process lockfile.
    pub fn lockfile_path(&self) -> PathBuf {
        self.instance_dir.join("lock")
    }
}
