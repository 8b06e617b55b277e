//! Declarative entity mapping.
//!
//! A domain type implements [`Entity`] to describe its table once, as an
//! [`EntityDef`], and to move its data in and out of a [`Record`]. The
//! registry resolves a definition into an
//! [`EntityDescriptor`](crate::registry::EntityDescriptor) a single time; the
//! engine never inspects domain values beyond their records.
//!
//! # Example
//!
//! ```ignore
//! impl Entity for Person {
//!     fn definition() -> EntityDef {
//!         EntityDef::new("person")
//!             .id(ColumnDef::new("id", FieldType::BigInt))
//!             .column(ColumnDef::new("name", FieldType::String))
//!             .association(
//!                 AssociationDef::to_many::<Phone>("phones")
//!                     .join_column("person_id")
//!                     .cascade([Cascade::All]),
//!             )
//!     }
//!     // to_record / from_record ...
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::coerce::ValueConverter;
use crate::record::Record;
use crate::value::FieldType;
use crate::Result;

/// A domain type mapped to exactly one table.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Mapping declaration of this type.
    fn definition() -> EntityDef;

    /// Field values and relations of this instance.
    fn to_record(&self) -> Record;

    /// Builds an instance from a materialized record.
    fn from_record(record: Record) -> Result<Self>;
}

/// Table mapping of an entity type.
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub(crate) table: String,
    pub(crate) ids: Vec<ColumnDef>,
    pub(crate) columns: Vec<ColumnDef>,
    pub(crate) associations: Vec<AssociationDef>,
}

impl EntityDef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ids: Vec::new(),
            columns: Vec::new(),
            associations: Vec::new(),
        }
    }

    /// Declares the identifier field. Exactly one is required.
    pub fn id(mut self, column: ColumnDef) -> Self {
        self.ids.push(column);
        self
    }

    /// Declares a scalar field. Declaration order fixes column order.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn association(mut self, association: AssociationDef) -> Self {
        self.associations.push(association);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// A scalar field and the column storing it.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub(crate) field: String,
    pub(crate) column: Option<String>,
    pub(crate) field_type: FieldType,
    pub(crate) converter: Option<Arc<dyn ValueConverter>>,
    pub(crate) system_managed: bool,
}

impl ColumnDef {
    /// A field stored in a column of the same name.
    pub fn new(field: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            field: field.into(),
            column: None,
            field_type,
            converter: None,
            system_managed: false,
        }
    }

    pub fn column_name(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Routes the field through `converter` instead of the built-in coercions.
    pub fn converter(mut self, converter: impl ValueConverter + 'static) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Marks a column the engine stamps with the current time on every write.
    ///
    /// System-managed columns are ignored when deciding whether an update
    /// would change anything.
    pub fn system_managed(mut self) -> Self {
        self.system_managed = true;
        self
    }
}

/// Cascade behavior declared on an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cascade {
    All,
    Persist,
    Merge,
    Remove,
}

/// Whether a save inserts a new graph or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveMode {
    Persist,
    Merge,
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveMode::Persist => f.write_str("PERSIST"),
            SaveMode::Merge => f.write_str("MERGE"),
        }
    }
}

/// Resolved set of [`Cascade`] flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CascadeSet {
    persist: bool,
    merge: bool,
    remove: bool,
}

impl CascadeSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            persist: true,
            merge: true,
            remove: true,
        }
    }

    /// True when saves in `mode` propagate through the association.
    pub fn covers(&self, mode: SaveMode) -> bool {
        match mode {
            SaveMode::Persist => self.persist,
            SaveMode::Merge => self.merge,
        }
    }

    /// True when deletes propagate through the association.
    pub fn removes(&self) -> bool {
        self.remove
    }

    pub fn is_empty(&self) -> bool {
        !(self.persist || self.merge || self.remove)
    }
}

impl FromIterator<Cascade> for CascadeSet {
    fn from_iter<I: IntoIterator<Item = Cascade>>(iter: I) -> Self {
        let mut set = CascadeSet::none();
        for cascade in iter {
            match cascade {
                Cascade::All => set = CascadeSet::all(),
                Cascade::Persist => set.persist = true,
                Cascade::Merge => set.merge = true,
                Cascade::Remove => set.remove = true,
            }
        }
        set
    }
}

/// Collection type of a multi-valued association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    /// Children in the order the join produced them.
    List,
    /// Distinct children in the order the join produced them.
    Set,
    /// Distinct children ordered by id.
    SortedSet,
}

/// One join column of an association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    pub(crate) name: String,
    pub(crate) referenced: Option<String>,
}

impl JoinColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced: None,
        }
    }

    /// Sets the column on the other side (defaults to that side's id column).
    pub fn referencing(mut self, referenced: impl Into<String>) -> Self {
        self.referenced = Some(referenced.into());
        self
    }
}

/// Bridge table of a many-to-many association.
///
/// `join_column`s point from the bridge to the owning entity,
/// `inverse_join_column`s from the bridge to the target entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub(crate) name: String,
    pub(crate) join_columns: Vec<JoinColumn>,
    pub(crate) inverse_join_columns: Vec<JoinColumn>,
}

impl JoinTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            join_columns: Vec::new(),
            inverse_join_columns: Vec::new(),
        }
    }

    pub fn join_column(mut self, column: JoinColumn) -> Self {
        self.join_columns.push(column);
        self
    }

    pub fn inverse_join_column(mut self, column: JoinColumn) -> Self {
        self.inverse_join_columns.push(column);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelationKind {
    ToOne,
    ToMany,
    ManyToMany,
}

/// A relationship field declaration.
#[derive(Clone)]
pub struct AssociationDef {
    pub(crate) field: String,
    pub(crate) kind: RelationKind,
    pub(crate) target: fn() -> EntityDef,
    pub(crate) join_columns: Vec<JoinColumn>,
    pub(crate) join_table: Option<JoinTable>,
    pub(crate) container: Option<Container>,
    pub(crate) cascade: CascadeSet,
}

impl fmt::Debug for AssociationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationDef")
            .field("field", &self.field)
            .field("kind", &self.kind)
            .field("join_columns", &self.join_columns)
            .field("join_table", &self.join_table)
            .field("container", &self.container)
            .field("cascade", &self.cascade)
            .finish()
    }
}

impl AssociationDef {
    fn new<T: Entity>(field: impl Into<String>, kind: RelationKind, container: Option<Container>) -> Self {
        Self {
            field: field.into(),
            kind,
            target: T::definition,
            join_columns: Vec::new(),
            join_table: None,
            container,
            cascade: CascadeSet::none(),
        }
    }

    /// Single-valued association; the foreign key lives on this entity's row.
    pub fn to_one<T: Entity>(field: impl Into<String>) -> Self {
        Self::new::<T>(field, RelationKind::ToOne, None)
    }

    /// Owned collection; the foreign key lives on the child rows.
    pub fn to_many<T: Entity>(field: impl Into<String>) -> Self {
        Self::new::<T>(field, RelationKind::ToMany, Some(Container::List))
    }

    /// Collection linked through a bridge table.
    pub fn many_to_many<T: Entity>(field: impl Into<String>) -> Self {
        Self::new::<T>(field, RelationKind::ManyToMany, Some(Container::List))
    }

    /// Adds a join column whose counterpart is the other side's id column.
    pub fn join_column(mut self, name: impl Into<String>) -> Self {
        self.join_columns.push(JoinColumn::new(name));
        self
    }

    /// Adds a join column with an explicit counterpart column.
    pub fn join_column_ref(mut self, name: impl Into<String>, referenced: impl Into<String>) -> Self {
        self.join_columns.push(JoinColumn::new(name).referencing(referenced));
        self
    }

    pub fn join_table(mut self, join_table: JoinTable) -> Self {
        self.join_table = Some(join_table);
        self
    }

    pub fn container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    pub fn cascade(mut self, cascade: impl IntoIterator<Item = Cascade>) -> Self {
        self.cascade = cascade.into_iter().collect();
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}
