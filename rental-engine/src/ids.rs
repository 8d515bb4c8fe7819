//! Type-safe entity identifiers using the TypeID specification
//!
//! Store-generated identifiers follow the
//! [TypeID Specification](https://github.com/jetpack-io/typeid/blob/main/spec/SPEC.md):
//! a per-entity prefix and a base32-encoded UUIDv7, so ids sort by creation
//! time and say which entity they belong to.
//!
//! ```rust
//! use rental_engine::ids::EntityId;
//!
//! let id = EntityId::new("bike");
//! println!("Bike ID: {}", id); // e.g., "bike_01h455vb4pex5vsknk084sn02q"
//! assert!(id.as_str().starts_with("bike_"));
//! ```
//!
//! Caller-supplied identifiers are plain strings and need not be TypeIDs.

use mti::prelude::*;
use std::fmt;

/// A prefixed, time-sortable entity identifier
///
/// # Format
///
/// `<prefix>_<base32-encoded-uuidv7>`, e.g. `rental_01h455vb4pex5vsknk084sn02q`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(MagicTypeId);

impl EntityId {
    /// Creates a new identifier with a UUIDv7 (time-sortable).
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self(prefix.create_type_id::<V7>())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_new() {
        let id = EntityId::new("rental");
        assert!(id.as_str().starts_with("rental_"));
        // prefix (6) + underscore (1) + suffix (26)
        assert_eq!(id.as_str().len(), 33);
    }

    #[test]
    fn test_entity_id_into_string() {
        let id = EntityId::new("bike");
        let text = id.to_string();
        assert_eq!(String::from(id.clone()), text);
        assert_eq!(id.as_ref(), text.as_str());
    }

    #[test]
    fn test_entity_id_ordering() {
        let id1 = EntityId::new("payment");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let id2 = EntityId::new("payment");

        // UUIDv7 IDs are time-ordered
        assert!(id1 < id2);
    }
}
