//! Payments settling a rental

use super::rental;
use crate::repository::{EntitySchema, FieldDef, FieldType, Generated, RelationDef};

/// Allowed values of `paymentMethod`
pub const PAYMENT_METHODS: &[&str] = &["CreditCard", "DebitCard", "Cash", "Paypal"];

static PAYMENT: EntitySchema = EntitySchema {
    name: "Payment",
    table: "payments",
    id_prefix: "payment",
    fields: &[
        FieldDef::new("createdAt", "created_at", FieldType::Timestamp)
            .generated(Generated::CreatedAt),
        FieldDef::new("updatedAt", "updated_at", FieldType::Timestamp)
            .generated(Generated::UpdatedAt),
        FieldDef::new("amount", "amount", FieldType::Number).optional(),
        FieldDef::new("paymentMethod", "payment_method", FieldType::Enum(PAYMENT_METHODS))
            .optional(),
        FieldDef::new("paymentTime", "payment_time", FieldType::Timestamp).optional(),
    ],
    relations: &[RelationDef::to_one("rental", rental::schema, "rental_id")],
};

/// Schema of `Payment`
pub fn schema() -> &'static EntitySchema {
    &PAYMENT
}
