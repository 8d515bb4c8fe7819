//! Bikes available for rent

use super::rental;
use crate::repository::{EntitySchema, FieldDef, FieldType, Generated, RelationDef};

/// Allowed values of `status`
pub const STATUSES: &[&str] = &["Available", "Rented", "Maintenance"];

static BIKE: EntitySchema = EntitySchema {
    name: "Bike",
    table: "bikes",
    id_prefix: "bike",
    fields: &[
        FieldDef::new("createdAt", "created_at", FieldType::Timestamp)
            .generated(Generated::CreatedAt),
        FieldDef::new("updatedAt", "updated_at", FieldType::Timestamp)
            .generated(Generated::UpdatedAt),
        FieldDef::new("location", "location", FieldType::String).optional(),
        FieldDef::new("model", "model", FieldType::String).optional(),
        FieldDef::new("status", "status", FieldType::Enum(STATUSES)).optional(),
    ],
    relations: &[RelationDef::inverse("rentals", rental::schema, "bike_id")],
};

/// Schema of `Bike`
pub fn schema() -> &'static EntitySchema {
    &BIKE
}
