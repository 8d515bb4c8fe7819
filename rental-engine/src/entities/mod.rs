//! Entity catalog of the rental system
//!
//! Each entity is a static [`EntitySchema`]; the engine derives queries,
//! validation and DDL from it.
//!
//! | Entity        | To-one relations | To-many relations |
//! |---------------|------------------|-------------------|
//! | `Bike`        |                  | `rentals`         |
//! | `Rental`      | `bike`, `user`   | `payments`        |
//! | `Payment`     | `rental`         |                   |
//! | `User`        |                  | `rentals`         |
//! | `UserProfile` |                  | `roles`           |
//! | `Role`        | `userProfile`    |                   |

use crate::repository::EntitySchema;

pub mod bike;
pub mod payment;
pub mod rental;
pub mod role;
pub mod user;
pub mod user_profile;

/// Every entity schema, in an order where referenced tables come first
pub fn catalog() -> Vec<&'static EntitySchema> {
    vec![
        bike::schema(),
        user::schema(),
        rental::schema(),
        payment::schema(),
        user_profile::schema(),
        role::schema(),
    ]
}

/// Find a schema by entity name (`Bike`) or table name (`bikes`)
pub fn lookup(name: &str) -> Option<&'static EntitySchema> {
    catalog()
        .into_iter()
        .find(|schema| schema.name == name || schema.table == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RelationKind;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("Bike").map(|s| s.table), Some("bikes"));
        assert_eq!(lookup("user_profiles").map(|s| s.name), Some("UserProfile"));
        assert!(lookup("Scooter").is_none());
    }

    #[test]
    fn test_prefixes_and_tables_are_unique() {
        let schemas = catalog();
        for (i, a) in schemas.iter().enumerate() {
            for b in &schemas[i + 1..] {
                assert_ne!(a.table, b.table);
                assert_ne!(a.id_prefix, b.id_prefix);
            }
        }
    }

    #[test]
    fn test_inverse_relations_mirror_a_to_one() {
        for schema in catalog() {
            for relation in schema.to_many_relations() {
                let RelationKind::Inverse { column } = relation.kind else {
                    continue;
                };
                let target = relation.target_schema();
                let mirrored = target
                    .to_one_relations()
                    .any(|(back, back_column)| {
                        back_column == column && std::ptr::eq(back.target_schema(), schema)
                    });
                assert!(
                    mirrored,
                    "{}.{} has no matching to-one on {}",
                    schema.name, relation.name, target.name
                );
            }
        }
    }

    #[test]
    fn test_every_entity_has_generated_timestamps() {
        for schema in catalog() {
            for name in ["createdAt", "updatedAt"] {
                let field = schema.field(name).unwrap();
                assert!(field.generated.is_some(), "{}.{}", schema.name, name);
                assert!(!field.nullable);
            }
        }
    }

    #[test]
    fn test_user_required_fields() {
        let user = user::schema();
        for name in ["username", "password", "roles"] {
            assert!(!user.field(name).unwrap().nullable, "{}", name);
        }
        assert!(user.field("email").unwrap().nullable);
    }
}
