//! The source adaptor seam.
//!
//! Everything that talks to a remote source (IMAP, CalDAV, Maildir, ...)
//! lives behind [`SourceAdaptor`]. The synchronizer drives it with
//! non-blocking calls on the single-threaded event loop; implementations
//! must not block and must honor [`SourceAdaptor::abort`] for in-flight
//! network operations.

use async_trait::async_trait;

use super::session::SyncSession;
use crate::entity::Entity;
use crate::error::Result;
use crate::types::{EntityType, RemoteId};

/// What a `Synchronize` request covers.
///
/// An empty type list means the whole source. Overlapping scopes queued
/// together coalesce into their union.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncScope {
    /// Entity types to synchronize; empty means all.
    pub entity_types: Vec<EntityType>,
}

impl SyncScope {
    /// The whole source.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the given types.
    pub fn of_types(entity_types: impl IntoIterator<Item = EntityType>) -> Self {
        Self {
            entity_types: entity_types.into_iter().collect(),
        }
    }

    /// True if this scope covers everything.
    pub fn is_all(&self) -> bool {
        self.entity_types.is_empty()
    }

    /// True if this scope covers `other` entirely.
    pub fn covers(&self, other: &SyncScope) -> bool {
        self.is_all()
            || (!other.is_all()
                && other
                    .entity_types
                    .iter()
                    .all(|t| self.entity_types.contains(t)))
    }

    /// Coalesces two scopes into the broader one (their union).
    pub fn merge(&mut self, other: &SyncScope) {
        if self.is_all() || other.is_all() {
            self.entity_types.clear();
            return;
        }
        for entity_type in &other.entity_types {
            if !self.entity_types.contains(entity_type) {
                self.entity_types.push(entity_type.clone());
            }
        }
    }
}

/// Adaptor to one remote source.
///
/// Single-threaded: the trait is `?Send` and is only ever called from
/// the resource's event loop.
#[async_trait(?Send)]
pub trait SourceAdaptor {
    /// True if this source needs a secret before credentialed work.
    ///
    /// Requests requiring credentials park until the secret store
    /// signals availability for this resource instance.
    fn needs_secret(&self) -> bool {
        false
    }

    /// Establishes the connection. `secret` is empty for sources that
    /// report [`needs_secret`](Self::needs_secret) as false.
    async fn connect(&mut self, secret: &str) -> Result<()>;

    /// Pulls remote state for the scope, reporting every observed item
    /// through the session.
    async fn synchronize(&mut self, scope: &SyncScope, session: &mut SyncSession<'_>)
        -> Result<()>;

    /// Replays a local creation. Returns the remote id the source
    /// assigned.
    async fn replay_create(&mut self, entity_type: &EntityType, entity: &Entity)
        -> Result<RemoteId>;

    /// Replays a local modification. May return a new remote id when
    /// the source reassigns one (e.g. a move between folders).
    async fn replay_modify(
        &mut self,
        entity_type: &EntityType,
        remote_id: &RemoteId,
        entity: &Entity,
    ) -> Result<Option<RemoteId>>;

    /// Replays a local deletion.
    async fn replay_delete(&mut self, entity_type: &EntityType, remote_id: &RemoteId)
        -> Result<()>;

    /// Verifies the connection for a connection inspection.
    async fn check_connection(&mut self) -> Result<()> {
        Ok(())
    }

    /// Cancels in-flight network operations. Must not block.
    fn abort(&mut self) {}

    /// Terminates the session with the source.
    async fn logout(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_covers() {
        let all = SyncScope::all();
        let mail = SyncScope::of_types([EntityType::new("mail")]);
        let mail_and_folder =
            SyncScope::of_types([EntityType::new("mail"), EntityType::new("folder")]);

        assert!(all.covers(&mail));
        assert!(!mail.covers(&all));
        assert!(mail_and_folder.covers(&mail));
        assert!(!mail.covers(&mail_and_folder));
    }

    #[test]
    fn test_scope_merge_is_union() {
        let mut scope = SyncScope::of_types([EntityType::new("mail")]);
        scope.merge(&SyncScope::of_types([EntityType::new("folder")]));
        assert_eq!(scope.entity_types.len(), 2);

        scope.merge(&SyncScope::all());
        assert!(scope.is_all());
    }
}
