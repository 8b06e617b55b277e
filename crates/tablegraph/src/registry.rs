//! Entity metadata registry.
//!
//! The registry resolves [`EntityDef`] declarations into immutable
//! [`EntityDescriptor`]s, one per table, and caches the join plan of every
//! root it is asked about. It is an explicit handle, normally shared as
//! `Arc<Registry>`; there is no global instance.
//!
//! Registration is idempotent and safe to race: the descriptor closure of a
//! type is fully validated before anything is published, and publication is
//! insert-if-absent, so the first descriptor published for a table wins and
//! every caller gets that same `Arc`.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::coerce::ValueConverter;
use crate::entity::{
    AssociationDef, CascadeSet, ColumnDef, Container, Entity, EntityDef, JoinColumn, RelationKind,
};
use crate::ident::validate_identifier;
use crate::plan::JoinPlan;
use crate::value::FieldType;
use crate::{Result, TableGraphError};

/// A resolved scalar field.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub field: String,
    pub column: String,
    pub field_type: FieldType,
    pub converter: Option<Arc<dyn ValueConverter>>,
    pub system_managed: bool,
}

impl FieldDescriptor {
    fn resolve(def: &ColumnDef) -> Result<Self> {
        let column = def.column.clone().unwrap_or_else(|| def.field.clone());
        validate_identifier(&column)?;
        Ok(Self {
            field: def.field.clone(),
            column,
            field_type: def.field_type,
            converter: def.converter.clone(),
            system_managed: def.system_managed,
        })
    }
}

/// Equality between a parent-side and a child-side column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnJoin {
    pub parent_column: String,
    pub child_column: String,
}

impl ColumnJoin {
    fn new(parent_column: impl Into<String>, child_column: impl Into<String>) -> Self {
        Self {
            parent_column: parent_column.into(),
            child_column: child_column.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AssociationKind {
    /// Foreign key on the parent row.
    ToOne { join: ColumnJoin },
    /// Foreign key on the child rows.
    ToMany { joins: Vec<ColumnJoin> },
    ManyToMany {
        bridge_table: String,
        parent_to_bridge: Vec<ColumnJoin>,
        bridge_to_child: Vec<ColumnJoin>,
    },
}

/// A resolved relationship field.
#[derive(Debug, Clone)]
pub struct AssociationDescriptor {
    pub field: String,
    pub parent_table: String,
    pub child_table: String,
    /// `None` for single-valued associations.
    pub container: Option<Container>,
    pub cascade: CascadeSet,
    pub kind: AssociationKind,
}

impl AssociationDescriptor {
    pub fn is_multi(&self) -> bool {
        self.container.is_some()
    }
}

/// Resolved mapping of one table.
#[derive(Debug)]
pub struct EntityDescriptor {
    pub table: String,
    pub id: FieldDescriptor,
    /// Scalar fields in declaration order; this order fixes result positions.
    pub columns: Vec<FieldDescriptor>,
    pub to_one: Vec<AssociationDescriptor>,
    /// To-many and many-to-many associations in declaration order.
    pub to_many: Vec<AssociationDescriptor>,
    /// Fields that hold a collection and start out empty.
    pub collection_fields: Vec<String>,
    /// Every column written by a save: id, scalars, then to-one foreign keys.
    pub database_columns: Vec<String>,
    /// Columns stamped by the engine and ignored by the update check.
    pub system_managed: HashSet<String>,
}

impl EntityDescriptor {
    /// Associations in traversal order: to-one first, then collections.
    pub fn associations(&self) -> impl Iterator<Item = &AssociationDescriptor> {
        self.to_one.iter().chain(self.to_many.iter())
    }

    /// The id or scalar field stored in `column`.
    pub fn field_for_column(&self, column: &str) -> Option<&FieldDescriptor> {
        std::iter::once(&self.id)
            .chain(self.columns.iter())
            .find(|f| f.column == column)
    }

    /// Number of result columns this table contributes to a join query.
    pub fn width(&self) -> usize {
        1 + self.columns.len()
    }

    fn resolve(def: EntityDef) -> Result<(Self, Vec<EntityDef>)> {
        validate_identifier(&def.table)?;
        let table = def.table;

        let id_def = match def.ids.as_slice() {
            [id] => id,
            [] => {
                return Err(TableGraphError::Configuration(format!(
                    "entity '{}' declares no id field",
                    table
                )))
            }
            ids => {
                return Err(TableGraphError::Configuration(format!(
                    "entity '{}' declares {} id fields, exactly one is required",
                    table,
                    ids.len()
                )))
            }
        };
        let id = FieldDescriptor::resolve(id_def)?;

        let mut columns = Vec::with_capacity(def.columns.len());
        let mut seen_columns: HashSet<String> = HashSet::from([id.column.clone()]);
        for column_def in &def.columns {
            let field = FieldDescriptor::resolve(column_def)?;
            if !seen_columns.insert(field.column.clone()) {
                return Err(TableGraphError::Configuration(format!(
                    "entity '{}' maps column '{}' twice",
                    table, field.column
                )));
            }
            columns.push(field);
        }

        let mut to_one = Vec::new();
        let mut to_many = Vec::new();
        let mut targets = Vec::with_capacity(def.associations.len());
        for assoc_def in def.associations {
            let target = (assoc_def.target)();
            let association = resolve_association(&table, &id.column, assoc_def, &target)?;
            if association.is_multi() {
                to_many.push(association);
            } else {
                to_one.push(association);
            }
            targets.push(target);
        }

        let collection_fields = to_many.iter().map(|a| a.field.clone()).collect();

        let mut database_columns = vec![id.column.clone()];
        database_columns.extend(columns.iter().map(|c| c.column.clone()));
        for association in &to_one {
            if let AssociationKind::ToOne { join } = &association.kind {
                if !database_columns.contains(&join.parent_column) {
                    database_columns.push(join.parent_column.clone());
                }
            }
        }

        let system_managed = std::iter::once(&id)
            .chain(columns.iter())
            .filter(|c| c.system_managed)
            .map(|c| c.column.clone())
            .collect();

        let descriptor = EntityDescriptor {
            table,
            id,
            columns,
            to_one,
            to_many,
            collection_fields,
            database_columns,
            system_managed,
        };
        Ok((descriptor, targets))
    }
}

fn id_column(def: &EntityDef) -> Result<String> {
    match def.ids.first() {
        Some(id) => Ok(id.column.clone().unwrap_or_else(|| id.field.clone())),
        None => Err(TableGraphError::Configuration(format!(
            "entity '{}' declares no id field",
            def.table
        ))),
    }
}

fn referenced_or(column: &JoinColumn, default: &str) -> String {
    column.referenced.clone().unwrap_or_else(|| default.to_string())
}

fn resolve_association(
    parent_table: &str,
    parent_id: &str,
    def: AssociationDef,
    target: &EntityDef,
) -> Result<AssociationDescriptor> {
    if target.table.is_empty() {
        return Err(TableGraphError::Configuration(format!(
            "association '{}' on '{}' targets a type that is not an entity",
            def.field, parent_table
        )));
    }
    let child_id = id_column(target)?;

    let kind = match def.kind {
        RelationKind::ToOne => {
            if def.container.is_some() {
                return Err(TableGraphError::Configuration(format!(
                    "single-valued association '{}' on '{}' cannot declare a container",
                    def.field, parent_table
                )));
            }
            let join = match def.join_columns.as_slice() {
                [] => ColumnJoin::new(def.field.clone(), child_id),
                [column] => ColumnJoin::new(column.name.clone(), referenced_or(column, &child_id)),
                _ => {
                    return Err(TableGraphError::Configuration(format!(
                        "single-valued association '{}' on '{}' supports one join column",
                        def.field, parent_table
                    )))
                }
            };
            AssociationKind::ToOne { join }
        }
        RelationKind::ToMany => {
            if def.join_columns.is_empty() {
                return Err(TableGraphError::Configuration(format!(
                    "association '{}' on '{}' needs at least one join column on '{}'",
                    def.field, parent_table, target.table
                )));
            }
            let joins = def
                .join_columns
                .iter()
                .map(|c| ColumnJoin::new(referenced_or(c, parent_id), c.name.clone()))
                .collect();
            AssociationKind::ToMany { joins }
        }
        RelationKind::ManyToMany => {
            let join_table = def.join_table.as_ref().ok_or_else(|| {
                TableGraphError::Configuration(format!(
                    "many-to-many association '{}' on '{}' declares no join table",
                    def.field, parent_table
                ))
            })?;
            if join_table.join_columns.is_empty() || join_table.inverse_join_columns.is_empty() {
                return Err(TableGraphError::Configuration(format!(
                    "join table '{}' of '{}.{}' needs join and inverse join columns",
                    join_table.name, parent_table, def.field
                )));
            }
            validate_identifier(&join_table.name)?;
            let parent_to_bridge = join_table
                .join_columns
                .iter()
                .map(|c| ColumnJoin::new(referenced_or(c, parent_id), c.name.clone()))
                .collect();
            let bridge_to_child = join_table
                .inverse_join_columns
                .iter()
                .map(|c| ColumnJoin::new(c.name.clone(), referenced_or(c, &child_id)))
                .collect();
            AssociationKind::ManyToMany {
                bridge_table: join_table.name.clone(),
                parent_to_bridge,
                bridge_to_child,
            }
        }
    };

    for join in kind_joins(&kind) {
        validate_identifier(&join.parent_column)?;
        validate_identifier(&join.child_column)?;
    }

    Ok(AssociationDescriptor {
        field: def.field,
        parent_table: parent_table.to_string(),
        child_table: target.table.clone(),
        container: def.container,
        cascade: def.cascade,
        kind,
    })
}

fn kind_joins(kind: &AssociationKind) -> Vec<&ColumnJoin> {
    match kind {
        AssociationKind::ToOne { join } => vec![join],
        AssociationKind::ToMany { joins } => joins.iter().collect(),
        AssociationKind::ManyToMany {
            parent_to_bridge,
            bridge_to_child,
            ..
        } => parent_to_bridge.iter().chain(bridge_to_child.iter()).collect(),
    }
}

/// Concurrent, table-keyed store of entity descriptors and join plans.
#[derive(Debug, Default)]
pub struct Registry {
    entities: DashMap<String, Arc<EntityDescriptor>>,
    plans: DashMap<String, Arc<JoinPlan>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` and every entity reachable from it.
    pub fn register<T: Entity>(&self) -> Result<Arc<EntityDescriptor>> {
        self.register_def(T::definition)
    }

    /// Registers the entity declared by `definition` and its closure.
    pub fn register_def(&self, definition: fn() -> EntityDef) -> Result<Arc<EntityDescriptor>> {
        let root = definition();
        let root_table = root.table.clone();
        if let Some(existing) = self.descriptor(&root_table) {
            return Ok(existing);
        }

        let mut resolved = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending = vec![root];
        while let Some(def) = pending.pop() {
            if self.entities.contains_key(&def.table) || !seen.insert(def.table.clone()) {
                continue;
            }
            let (descriptor, targets) = EntityDescriptor::resolve(def)?;
            pending.extend(
                targets
                    .into_iter()
                    .filter(|t| !seen.contains(&t.table)),
            );
            resolved.push(descriptor);
        }

        for descriptor in resolved {
            let table = descriptor.table.clone();
            let published = self
                .entities
                .entry(table.clone())
                .or_insert_with(|| Arc::new(descriptor))
                .value()
                .clone();
            debug!(
                table = %table,
                columns = published.columns.len(),
                associations = published.to_one.len() + published.to_many.len(),
                "Registered entity"
            );
        }

        self.get(&root_table)
    }

    /// Registered descriptor of `table`, if any.
    pub fn descriptor(&self, table: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.get(table).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered descriptor of `table`; a configuration error when absent.
    pub fn get(&self, table: &str) -> Result<Arc<EntityDescriptor>> {
        self.descriptor(table).ok_or_else(|| {
            TableGraphError::Configuration(format!("table '{}' is not a registered entity", table))
        })
    }

    /// Join plan rooted at `T`, registering `T` first when needed.
    pub fn join_plan<T: Entity>(&self) -> Result<Arc<JoinPlan>> {
        let descriptor = self.register::<T>()?;
        self.join_plan_for(&descriptor.table)
    }

    /// Join plan rooted at an already registered table.
    pub fn join_plan_for(&self, table: &str) -> Result<Arc<JoinPlan>> {
        if let Some(plan) = self.plans.get(table).map(|entry| Arc::clone(entry.value())) {
            return Ok(plan);
        }
        let plan = Arc::new(JoinPlan::build(self, table)?);
        let published = self
            .plans
            .entry(table.to_string())
            .or_insert(plan)
            .value()
            .clone();
        Ok(published)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
