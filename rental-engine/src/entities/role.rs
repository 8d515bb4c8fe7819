//! Roles granted to a user profile

use super::user_profile;
use crate::repository::{EntitySchema, FieldDef, FieldType, Generated, RelationDef};

static ROLE: EntitySchema = EntitySchema {
    name: "Role",
    table: "roles",
    id_prefix: "role",
    fields: &[
        FieldDef::new("createdAt", "created_at", FieldType::Timestamp)
            .generated(Generated::CreatedAt),
        FieldDef::new("updatedAt", "updated_at", FieldType::Timestamp)
            .generated(Generated::UpdatedAt),
    ],
    relations: &[RelationDef::to_one(
        "userProfile",
        user_profile::schema,
        "user_profile_id",
    )],
};

/// Schema of `Role`
pub fn schema() -> &'static EntitySchema {
    &ROLE
}
