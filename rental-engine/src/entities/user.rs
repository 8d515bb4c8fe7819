//! Customers and staff accounts

use super::rental;
use crate::repository::{EntitySchema, FieldDef, FieldType, Generated, RelationDef};

static USER: EntitySchema = EntitySchema {
    name: "User",
    table: "users",
    id_prefix: "user",
    fields: &[
        FieldDef::new("createdAt", "created_at", FieldType::Timestamp)
            .generated(Generated::CreatedAt),
        FieldDef::new("updatedAt", "updated_at", FieldType::Timestamp)
            .generated(Generated::UpdatedAt),
        FieldDef::new("email", "email", FieldType::String).optional(),
        FieldDef::new("firstName", "first_name", FieldType::String).optional(),
        FieldDef::new("lastName", "last_name", FieldType::String).optional(),
        FieldDef::new("username", "username", FieldType::String),
        FieldDef::new("password", "password", FieldType::String),
        // list of role names
        FieldDef::new("roles", "roles", FieldType::Json),
    ],
    relations: &[RelationDef::inverse("rentals", rental::schema, "user_id")],
};

/// Schema of `User`
pub fn schema() -> &'static EntitySchema {
    &USER
}
