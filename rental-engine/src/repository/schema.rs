//! Declarative entity metadata
//!
//! An [`EntitySchema`] is the only thing the engine knows about an entity:
//! its table, identifier prefix, typed attributes and relations. All dynamic
//! SQL is assembled from these `'static` descriptions, so table and column
//! names never come from caller input.

use super::value::FieldType;

/// Field whose value the engine fills in when the caller leaves it out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generated {
    /// Set to the current time on insert
    CreatedAt,
    /// Set to the current time on insert and on every update
    UpdatedAt,
}

/// A typed attribute of an entity
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    /// Public (camelCase) name used in filters, inputs and output
    pub name: &'static str,
    /// Column name in the entity table
    pub column: &'static str,
    /// Semantic type
    pub ty: FieldType,
    /// Whether `NULL` is an accepted value
    pub nullable: bool,
    /// Whether the engine fills the value in
    pub generated: Option<Generated>,
}

impl FieldDef {
    /// A required field
    #[must_use]
    pub const fn new(name: &'static str, column: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            column,
            ty,
            nullable: false,
            generated: None,
        }
    }

    /// Mark the field as nullable
    #[must_use]
    pub const fn optional(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }

    /// Mark the field as generated
    #[must_use]
    pub const fn generated(self, generated: Generated) -> Self {
        Self {
            generated: Some(generated),
            ..self
        }
    }
}

/// How a relation is materialized in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// This entity holds a nullable foreign key column
    ToOne {
        /// Foreign key column on this entity's table
        column: &'static str,
    },
    /// The target holds a foreign key column pointing back at this entity
    Inverse {
        /// Foreign key column on the target's table
        column: &'static str,
    },
    /// Many-to-many through a join table
    Join {
        /// Join table name
        table: &'static str,
        /// Column holding this entity's id
        source_column: &'static str,
        /// Column holding the target's id
        target_column: &'static str,
    },
}

/// A named association from one entity to another
#[derive(Debug, Clone, Copy)]
pub struct RelationDef {
    /// Public (camelCase) name
    pub name: &'static str,
    /// Schema of the related entity
    pub target: fn() -> &'static EntitySchema,
    /// Storage shape
    pub kind: RelationKind,
}

impl RelationDef {
    /// Relation stored as a foreign key on this entity
    #[must_use]
    pub const fn to_one(
        name: &'static str,
        target: fn() -> &'static EntitySchema,
        column: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationKind::ToOne { column },
        }
    }

    /// To-many relation materialized by the target's foreign key
    #[must_use]
    pub const fn inverse(
        name: &'static str,
        target: fn() -> &'static EntitySchema,
        column: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationKind::Inverse { column },
        }
    }

    /// To-many relation through a join table
    #[must_use]
    pub const fn join(
        name: &'static str,
        target: fn() -> &'static EntitySchema,
        table: &'static str,
        source_column: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationKind::Join {
                table,
                source_column,
                target_column,
            },
        }
    }

    /// Whether this relation holds a set of members
    #[must_use]
    pub const fn is_to_many(&self) -> bool {
        !matches!(self.kind, RelationKind::ToOne { .. })
    }

    /// The related entity's schema
    #[must_use]
    pub fn target_schema(&self) -> &'static EntitySchema {
        (self.target)()
    }

    /// Where the members of a to-many relation are recorded
    ///
    /// `None` for to-one relations.
    #[must_use]
    pub fn membership(&self) -> Option<Membership> {
        match self.kind {
            RelationKind::ToOne { .. } => None,
            RelationKind::Inverse { column } => Some(Membership {
                table: self.target_schema().table,
                parent_column: column,
                member_column: "id",
                inverse: true,
            }),
            RelationKind::Join {
                table,
                source_column,
                target_column,
            } => Some(Membership {
                table,
                parent_column: source_column,
                member_column: target_column,
                inverse: false,
            }),
        }
    }
}

/// Table and columns pairing a parent with the members of a to-many relation
///
/// For inverse relations `table` is the target's own table and
/// `member_column` is its `id`; for join relations it is the join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// Table holding one row per (parent, member) pair
    pub table: &'static str,
    /// Column holding the parent id
    pub parent_column: &'static str,
    /// Column holding the member id
    pub member_column: &'static str,
    /// Whether `table` is the target entity's table
    pub inverse: bool,
}

/// Something a public name can refer to on an entity
#[derive(Debug, Clone, Copy)]
pub enum Member {
    /// The identifier
    Id,
    /// A typed attribute
    Field(&'static FieldDef),
    /// A relation
    Relation(&'static RelationDef),
}

/// Complete description of one entity
#[derive(Debug)]
pub struct EntitySchema {
    /// Entity name, e.g. `Bike`
    pub name: &'static str,
    /// Table name, e.g. `bikes`
    pub table: &'static str,
    /// TypeID prefix for generated identifiers
    pub id_prefix: &'static str,
    /// Attributes in column order
    pub fields: &'static [FieldDef],
    /// Relations in declaration order
    pub relations: &'static [RelationDef],
}

impl EntitySchema {
    /// Look up an attribute by public name
    pub fn field(&'static self, name: &str) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a relation by public name
    pub fn relation(&'static self, name: &str) -> Option<&'static RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Resolve a public name to the member it designates
    pub fn resolve(&'static self, name: &str) -> Option<Member> {
        if name == "id" {
            return Some(Member::Id);
        }
        self.field(name)
            .map(Member::Field)
            .or_else(|| self.relation(name).map(Member::Relation))
    }

    /// To-one relations, in declaration order
    pub fn to_one_relations(&'static self) -> impl Iterator<Item = (&'static RelationDef, &'static str)> {
        self.relations.iter().filter_map(|r| match r.kind {
            RelationKind::ToOne { column } => Some((r, column)),
            _ => None,
        })
    }

    /// To-many relations, in declaration order
    pub fn to_many_relations(&'static self) -> impl Iterator<Item = &'static RelationDef> {
        self.relations.iter().filter(|r| r.is_to_many())
    }

    /// `CREATE TABLE IF NOT EXISTS` statements for this entity
    ///
    /// The first statement creates the entity table; any further ones create
    /// join tables for which this entity is the source side.
    pub fn create_table_sql(&'static self) -> Vec<String> {
        let mut columns = vec![
            "id TEXT PRIMARY KEY NOT NULL".to_string(),
            "version INTEGER NOT NULL DEFAULT 1".to_string(),
        ];
        for field in self.fields {
            let null = if field.nullable { "" } else { " NOT NULL" };
            columns.push(format!("{} {}{}", field.column, field.ty.sql_type(), null));
        }
        for (relation, column) in self.to_one_relations() {
            columns.push(format!(
                "{} TEXT REFERENCES {}(id) ON DELETE SET NULL",
                column,
                relation.target_schema().table
            ));
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            columns.join(", ")
        )];

        for relation in self.relations {
            if let RelationKind::Join {
                table,
                source_column,
                target_column,
            } = relation.kind
            {
                statements.push(format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                     {source_column} TEXT NOT NULL REFERENCES {src}(id) ON DELETE CASCADE, \
                     {target_column} TEXT NOT NULL REFERENCES {tgt}(id) ON DELETE CASCADE, \
                     PRIMARY KEY ({source_column}, {target_column}))",
                    src = self.table,
                    tgt = relation.target_schema().table,
                ));
            }
        }

        statements
    }
}
