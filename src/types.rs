//! Core type definitions for Estuary identifiers, revisions, and timestamps.
//!
//! Entity ids are opaque 128-bit values generated as UUID v7 (time-ordered)
//! and displayed in a URL-safe unpadded base64 form. Revisions are a single
//! strictly monotonic u64 clock per resource instance.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit entity identifier.
///
/// Generated as UUID v7 so freshly created entities sort roughly by
/// creation time. The display form is URL-safe unpadded base64 of the
/// 16 raw bytes (22 characters).
///
/// # Example
/// ```
/// use estuary::EntityId;
///
/// let id = EntityId::new();
/// let display = id.to_string();
/// assert_eq!(display.len(), 22);
/// assert_eq!(EntityId::from_display(&display).unwrap(), id);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId([u8; 16]);

impl EntityId {
    /// Creates a new EntityId with a UUID v7 (time-ordered).
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::now_v7().into_bytes())
    }

    /// Creates a nil (all zeros) EntityId.
    /// Useful for testing or sentinel values.
    #[inline]
    pub fn nil() -> Self {
        Self([0u8; 16])
    }

    /// Returns the raw bytes for storage.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Creates an EntityId from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates an EntityId from a byte slice.
    ///
    /// Returns `None` if the slice is not exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parses an EntityId from its URL-safe base64 display form.
    ///
    /// Returns `None` if the input does not decode to 16 bytes.
    pub fn from_display(s: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl Default for EntityId {
    /// Returns a nil (all zeros) EntityId.
    ///
    /// For a new unique ID, use [`EntityId::new()`].
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

/// Revision number: the per-instance version clock.
///
/// A single strictly monotonic counter shared by all entities in one
/// resource instance. Every committed mutation increments it by one;
/// there are no gaps.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    /// Revision zero: the state before any mutation.
    pub const ZERO: Self = Self(0);

    /// The revision following this one.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw u64.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns big-endian bytes for storage (lexicographic order matches
    /// numeric order).
    #[inline]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Creates a revision from big-endian storage bytes.
    #[inline]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity type tag (e.g. `mail`, `folder`, `event`, `todo`).
///
/// The set of types is open and resource-defined; the core treats them
/// as opaque strings and uses them to select sub-databases, schemas, and
/// preprocessors.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityType(String);

impl EntityType {
    /// Creates a type tag from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of an entity property (e.g. `summary`, `threadId`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyName(String);

impl PropertyName {
    /// Creates a property name from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the property name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PropertyName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier assigned by the external source for an entity.
///
/// Opaque to the core; only the remote-id map interprets it as a key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteId(String);

impl RemoteId {
    /// Creates a remote id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the remote id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the remote id as bytes for key encoding.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unix timestamp in milliseconds.
///
/// Using i64 allows representing dates far into the future and past.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    ///
    /// If the system clock is before the Unix epoch (should never happen
    /// in practice), returns a timestamp of 0 rather than panicking.
    #[inline]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Creates a timestamp from Unix milliseconds.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as Unix milliseconds.
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns big-endian bytes for storage (enables lexicographic ordering).
    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_new_is_unique() {
        let id1 = EntityId::new();
        let id2 = EntityId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_entity_id_nil() {
        let id = EntityId::nil();
        assert_eq!(id.as_bytes(), &[0u8; 16]);
    }

    #[test]
    fn test_entity_id_bytes_roundtrip() {
        let id = EntityId::new();
        let bytes = *id.as_bytes();
        let restored = EntityId::from_bytes(bytes);
        assert_eq!(id, restored);
    }

    #[test]
    fn test_entity_id_display_roundtrip() {
        let id = EntityId::new();
        let display = id.to_string();
        assert_eq!(display.len(), 22);
        assert!(!display.contains('='));
        assert_eq!(EntityId::from_display(&display), Some(id));
    }

    #[test]
    fn test_entity_id_from_display_rejects_garbage() {
        assert_eq!(EntityId::from_display("not base64 at all!"), None);
        assert_eq!(EntityId::from_display("AAAA"), None);
    }

    #[test]
    fn test_entity_id_serialization() {
        let id = EntityId::new();
        let bytes = bincode::serialize(&id).unwrap();
        let restored: EntityId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_entity_id_v7_roughly_time_ordered() {
        let id1 = EntityId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = EntityId::new();
        assert!(id1 < id2, "v7 ids should sort by creation time");
    }

    #[test]
    fn test_revision_next() {
        let r = Revision::ZERO;
        assert_eq!(r.next(), Revision(1));
        assert_eq!(r.next().next(), Revision(2));
    }

    #[test]
    fn test_revision_be_bytes_ordering() {
        let r1 = Revision(255);
        let r2 = Revision(256);
        assert!(r1.to_be_bytes() < r2.to_be_bytes());
        assert_eq!(Revision::from_be_bytes(r1.to_be_bytes()), r1);
    }

    #[test]
    fn test_entity_type_display() {
        let t = EntityType::new("mail");
        assert_eq!(t.as_str(), "mail");
        assert_eq!(format!("{}", t), "mail");
    }

    #[test]
    fn test_remote_id() {
        let r = RemoteId::new("INBOX/17");
        assert_eq!(r.as_str(), "INBOX/17");
        assert_eq!(r.as_bytes(), b"INBOX/17");
    }

    #[test]
    fn test_timestamp_ordering() {
        let t1 = Timestamp::from_millis(1000);
        let t2 = Timestamp::from_millis(2000);
        assert!(t1 < t2);
        assert!(t1.to_be_bytes() < t2.to_be_bytes());
    }

    #[test]
    fn test_timestamp_now() {
        let t1 = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = Timestamp::now();
        assert!(t1 < t2, "Timestamps should be ordered");
    }
}
