//! Typed property values and per-type schemas.
//!
//! Entities carry a dynamic property bag. Instead of a stringly-typed
//! variant container, properties are a closed sum type ([`Value`]) plus a
//! per-type [`TypeSchema`] that records the allowed keys and their value
//! kinds. Preprocessors and the query engine operate on this typed sum.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{EntityId, PropertyName, Timestamp};

/// A typed property value.
///
/// `Blob` carries a filesystem path: before a write it may point at a
/// staging location anywhere on disk; the entity store relocates it into
/// the instance's managed blob directory as part of the write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null; distinct from an absent property.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed 64-bit integer.
    I64(i64),
    /// 64-bit float.
    F64(f64),
    /// Raw bytes (e.g. a MIME message).
    Bytes(Vec<u8>),
    /// UTF-8 string.
    String(String),
    /// Unix-millisecond timestamp.
    Timestamp(Timestamp),
    /// Reference to another entity (relations are modelled as a property
    /// on the child plus an index, never an in-memory pointer).
    IdRef(EntityId),
    /// Large binary payload stored as a file next to the database.
    Blob(PathBuf),
    /// Homogeneous or heterogeneous list of values.
    List(Vec<Value>),
}

/// Discriminant of a [`Value`], used by schemas and filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// [`Value::Null`]
    Null,
    /// [`Value::Bool`]
    Bool,
    /// [`Value::I64`]
    I64,
    /// [`Value::F64`]
    F64,
    /// [`Value::Bytes`]
    Bytes,
    /// [`Value::String`]
    String,
    /// [`Value::Timestamp`]
    Timestamp,
    /// [`Value::IdRef`]
    IdRef,
    /// [`Value::Blob`]
    Blob,
    /// [`Value::List`]
    List,
}

impl Value {
    /// Returns the discriminant of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::I64(_) => ValueKind::I64,
            Value::F64(_) => ValueKind::F64,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::String(_) => ValueKind::String,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::IdRef(_) => ValueKind::IdRef,
            Value::Blob(_) => ValueKind::Blob,
            Value::List(_) => ValueKind::List,
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the string content, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an `I64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the timestamp content, if this is a `Timestamp`.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns the referenced entity id, if this is an `IdRef`.
    pub fn as_id(&self) -> Option<EntityId> {
        match self {
            Value::IdRef(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the byte content, if this is `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the list content, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Total order over values: kind rank first, then content.
    ///
    /// Used by sort and reduce-representative selection. Floats compare
    /// by IEEE total order, so NaN sorts deterministically.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::I64(a), Value::I64(b)) => a.cmp(b),
            (Value::F64(a), Value::F64(b)) => a.total_cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::IdRef(a), Value::IdRef(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => a.kind().cmp(&b.kind()),
        }
    }

    /// Order-preserving key bytes for secondary indices.
    ///
    /// Integer and timestamp values are encoded big-endian so that
    /// lexicographic key order matches numeric order. Negative timestamps
    /// (pre-1970) are not supported by the index encoding.
    pub fn index_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Bool(b) => vec![u8::from(*b)],
            Value::I64(v) => v.to_be_bytes().to_vec(),
            Value::F64(v) => v.to_bits().to_be_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Timestamp(t) => t.to_be_bytes().to_vec(),
            Value::IdRef(id) => id.as_bytes().to_vec(),
            Value::Blob(p) => p.to_string_lossy().into_owned().into_bytes(),
            // Lists are indexed per element, never as a whole.
            Value::List(_) => Vec::new(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I64(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::String(s) => write!(f, "{}", s),
            Value::Timestamp(t) => write!(f, "{}", t),
            Value::IdRef(id) => write!(f, "{}", id),
            Value::Blob(p) => write!(f, "blob:{}", p.display()),
            Value::List(l) => write!(f, "[{} values]", l.len()),
        }
    }
}

/// The property bag of an entity.
///
/// A `BTreeMap` keeps property iteration deterministic, which matters
/// for index maintenance and test reproducibility.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyMap(BTreeMap<PropertyName, Value>);

impl PropertyMap {
    /// Creates an empty property map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property, returning the previous value if any.
    pub fn set(&mut self, name: impl Into<PropertyName>, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }

    /// Removes a property, returning its value if present.
    pub fn unset(&mut self, name: &PropertyName) -> Option<Value> {
        self.0.remove(name)
    }

    /// Looks up a property value.
    pub fn get(&self, name: &PropertyName) -> Option<&Value> {
        self.0.get(name)
    }

    /// Looks up a property by name string.
    pub fn get_str_key(&self, name: &str) -> Option<&Value> {
        self.0.get(&PropertyName::new(name))
    }

    /// Returns true if the property is present (even if `Null`).
    pub fn contains(&self, name: &PropertyName) -> bool {
        self.0.contains_key(name)
    }

    /// Iterates `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&PropertyName, &Value)> {
        self.0.iter()
    }

    /// Returns all property names.
    pub fn names(&self) -> impl Iterator<Item = &PropertyName> {
        self.0.keys()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(PropertyName, Value)> for PropertyMap {
    fn from_iter<T: IntoIterator<Item = (PropertyName, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Allowed keys and value kinds for one entity type.
///
/// Undeclared properties are permitted (the type set is open and
/// resource-defined), but a declared property must carry one of its
/// declared kinds, or `Null`.
#[derive(Clone, Debug, Default)]
pub struct TypeSchema {
    properties: BTreeMap<PropertyName, Vec<ValueKind>>,
}

impl TypeSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a property with a single allowed kind.
    pub fn property(mut self, name: impl Into<PropertyName>, kind: ValueKind) -> Self {
        self.properties.insert(name.into(), vec![kind]);
        self
    }

    /// Declares a property with several allowed kinds.
    pub fn property_kinds(
        mut self,
        name: impl Into<PropertyName>,
        kinds: impl IntoIterator<Item = ValueKind>,
    ) -> Self {
        self.properties
            .insert(name.into(), kinds.into_iter().collect());
        self
    }

    /// Returns the declared kinds for a property, if declared.
    pub fn kinds_of(&self, name: &PropertyName) -> Option<&[ValueKind]> {
        self.properties.get(name).map(Vec::as_slice)
    }

    /// Validates a property map against this schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if a declared property carries
    /// a value of an undeclared kind.
    pub fn validate(&self, properties: &PropertyMap) -> Result<()> {
        for (name, value) in properties.iter() {
            if value.is_null() {
                continue;
            }
            if let Some(kinds) = self.properties.get(name) {
                let kind = match value {
                    // Lists are validated per element.
                    Value::List(items) => {
                        for item in items {
                            if !item.is_null() && !kinds.contains(&item.kind()) {
                                return Err(Error::invalid_payload(format!(
                                    "property '{}' list element has kind {:?}, expected one of {:?}",
                                    name,
                                    item.kind(),
                                    kinds
                                )));
                            }
                        }
                        continue;
                    }
                    other => other.kind(),
                };
                if !kinds.contains(&kind) {
                    return Err(Error::invalid_payload(format!(
                        "property '{}' has kind {:?}, expected one of {:?}",
                        name, kind, kinds
                    )));
                }
            }
        }
        Ok(())
    }
}
