//! Identity-provider profiles

use super::role;
use crate::repository::{EntitySchema, FieldDef, FieldType, Generated, RelationDef};

static USER_PROFILE: EntitySchema = EntitySchema {
    name: "UserProfile",
    table: "user_profiles",
    id_prefix: "profile",
    fields: &[
        FieldDef::new("createdAt", "created_at", FieldType::Timestamp)
            .generated(Generated::CreatedAt),
        FieldDef::new("updatedAt", "updated_at", FieldType::Timestamp)
            .generated(Generated::UpdatedAt),
        FieldDef::new("email", "email", FieldType::String).optional(),
        FieldDef::new("emailAddress", "email_address", FieldType::String).optional(),
        FieldDef::new("phone", "phone", FieldType::String).optional(),
        FieldDef::new("phoneNumber", "phone_number", FieldType::String).optional(),
        FieldDef::new("role", "role", FieldType::String).optional(),
        FieldDef::new("userRole", "user_role", FieldType::String).optional(),
        FieldDef::new("isAnonymous", "is_anonymous", FieldType::Boolean).optional(),
        FieldDef::new("confirmedAt", "confirmed_at", FieldType::Timestamp).optional(),
        FieldDef::new("lastSignInAt", "last_sign_in_at", FieldType::Timestamp).optional(),
        FieldDef::new("appMetadata", "app_metadata", FieldType::Json).optional(),
        FieldDef::new("userMetadata", "user_metadata", FieldType::Json).optional(),
    ],
    relations: &[RelationDef::inverse("roles", role::schema, "user_profile_id")],
};

/// Schema of `UserProfile`
pub fn schema() -> &'static EntitySchema {
    &USER_PROFILE
}
