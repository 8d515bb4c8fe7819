//! Rentals of a bike by a user

use super::{bike, payment, user};
use crate::repository::{EntitySchema, FieldDef, FieldType, Generated, RelationDef};

static RENTAL: EntitySchema = EntitySchema {
    name: "Rental",
    table: "rentals",
    id_prefix: "rental",
    fields: &[
        FieldDef::new("createdAt", "created_at", FieldType::Timestamp)
            .generated(Generated::CreatedAt),
        FieldDef::new("updatedAt", "updated_at", FieldType::Timestamp)
            .generated(Generated::UpdatedAt),
        FieldDef::new("startTime", "start_time", FieldType::Timestamp).optional(),
        FieldDef::new("endTime", "end_time", FieldType::Timestamp).optional(),
        FieldDef::new("price", "price", FieldType::Number).optional(),
    ],
    relations: &[
        RelationDef::to_one("bike", bike::schema, "bike_id"),
        RelationDef::to_one("user", user::schema, "user_id"),
        RelationDef::inverse("payments", payment::schema, "rental_id"),
    ],
};

/// Schema of `Rental`
pub fn schema() -> &'static EntitySchema {
    &RENTAL
}
