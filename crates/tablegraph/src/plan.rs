//! Cycle-safe join synthesis.
//!
//! A [`JoinPlan`] is the single outer-join SELECT that loads an entity together
//! with everything reachable through its associations. The plan walks the
//! association graph depth-first from the root and skips any association whose
//! target table is already on the current path, so self-referencing and
//! mutually referencing mappings terminate.
//!
//! Column layout is positional: every visited table contributes its id column
//! followed by its scalar columns, in visit order. The reconstructor reads rows
//! back using the offsets recorded here.

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use crate::registry::{AssociationDescriptor, AssociationKind, ColumnJoin, EntityDescriptor, Registry};
use crate::Result;

/// A table occurrence in the plan.
#[derive(Debug)]
pub struct PlannedTable {
    pub descriptor: Arc<EntityDescriptor>,
    pub alias: String,
    /// Position of the id column in a result row.
    pub offset: usize,
    pub width: usize,
}

/// A traversed association between two table occurrences.
#[derive(Debug)]
pub struct PlannedAssociation {
    pub association: AssociationDescriptor,
    pub parent_slot: usize,
    pub slot: usize,
}

#[derive(Debug)]
pub struct JoinPlan {
    root_table: String,
    tables: Vec<PlannedTable>,
    associations: Vec<PlannedAssociation>,
    columns_sql: String,
    from_sql: String,
}

impl JoinPlan {
    /// Synthesizes the plan rooted at a registered table.
    pub fn build(registry: &Registry, root_table: &str) -> Result<Self> {
        let root = registry.get(root_table)?;
        let mut builder = PlanBuilder {
            registry,
            tables: Vec::new(),
            associations: Vec::new(),
            aliases: HashSet::new(),
            path: HashSet::new(),
            columns: Vec::new(),
            joins: String::new(),
            offset: 0,
        };

        let alias = builder.alias_for(&root.table);
        let from_head = table_ref(&root.table, &alias);
        builder.path.insert(root.table.clone());
        let slot = builder.enter(root, alias);
        builder.walk(slot)?;

        Ok(Self {
            root_table: root_table.to_string(),
            tables: builder.tables,
            associations: builder.associations,
            columns_sql: builder.columns.join(", "),
            from_sql: format!("{}{}", from_head, builder.joins),
        })
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }

    /// Table occurrences in visit order; slot 0 is the root.
    pub fn tables(&self) -> &[PlannedTable] {
        &self.tables
    }

    /// Traversed associations in visit order.
    pub fn associations(&self) -> &[PlannedAssociation] {
        &self.associations
    }

    pub fn root(&self) -> &PlannedTable {
        &self.tables[0]
    }

    /// Alias the root table carries in generated SQL.
    pub fn root_alias(&self) -> &str {
        &self.tables[0].alias
    }

    /// Total number of columns in a result row.
    pub fn column_count(&self) -> usize {
        self.tables.iter().map(|t| t.width).sum()
    }

    pub fn columns_sql(&self) -> &str {
        &self.columns_sql
    }

    pub fn from_sql(&self) -> &str {
        &self.from_sql
    }

    pub fn select_sql(&self) -> String {
        format!("SELECT {} FROM {}", self.columns_sql, self.from_sql)
    }

    pub fn select_where(&self, clause: &str) -> String {
        format!("{} WHERE {}", self.select_sql(), clause)
    }

    /// Lookup of one root by id, with a single `?` for the id value.
    pub fn select_by_id(&self) -> String {
        self.select_where(&format!(
            "{}.{} = ?",
            self.root_alias(),
            self.root().descriptor.id.column
        ))
    }

    pub fn select_distinct_where(&self, clause: &str) -> String {
        format!(
            "SELECT DISTINCT {} FROM {} WHERE {}",
            self.columns_sql, self.from_sql, clause
        )
    }
}

fn table_ref(table: &str, alias: &str) -> String {
    if table == alias {
        table.to_string()
    } else {
        format!("{} {}", table, alias)
    }
}

struct PlanBuilder<'a> {
    registry: &'a Registry,
    tables: Vec<PlannedTable>,
    associations: Vec<PlannedAssociation>,
    aliases: HashSet<String>,
    path: HashSet<String>,
    columns: Vec<String>,
    joins: String,
    offset: usize,
}

impl PlanBuilder<'_> {
    /// First use of a table keeps its name; later uses get `c{n}_{table}`.
    fn alias_for(&mut self, table: &str) -> String {
        let base = table.replace('.', "_");
        let mut alias = base.clone();
        let mut n = self.aliases.len();
        while self.aliases.contains(&alias) {
            alias = format!("c{}_{}", n, base);
            n += 1;
        }
        self.aliases.insert(alias.clone());
        alias
    }

    fn enter(&mut self, descriptor: Arc<EntityDescriptor>, alias: String) -> usize {
        let width = descriptor.width();
        self.columns.push(format!("{}.{}", alias, descriptor.id.column));
        for column in &descriptor.columns {
            self.columns.push(format!("{}.{}", alias, column.column));
        }
        self.tables.push(PlannedTable {
            descriptor,
            alias,
            offset: self.offset,
            width,
        });
        self.offset += width;
        self.tables.len() - 1
    }

    fn push_join(&mut self, table: &str, alias: &str, parent_alias: &str, joins: &[ColumnJoin]) {
        let predicate = joins
            .iter()
            .map(|j| format!("{}.{} = {}.{}", parent_alias, j.parent_column, alias, j.child_column))
            .collect::<Vec<_>>()
            .join(" AND ");
        // Writing to a String cannot fail.
        let _ = write!(self.joins, " LEFT JOIN {} ON {}", table_ref(table, alias), predicate);
    }

    fn walk(&mut self, slot: usize) -> Result<()> {
        let descriptor = Arc::clone(&self.tables[slot].descriptor);
        let parent_alias = self.tables[slot].alias.clone();

        for association in descriptor.associations() {
            if self.path.contains(&association.child_table) {
                continue;
            }
            let child = self.registry.get(&association.child_table)?;

            let child_alias = match &association.kind {
                AssociationKind::ToOne { join } => {
                    let alias = self.alias_for(&child.table);
                    self.push_join(&child.table, &alias, &parent_alias, std::slice::from_ref(join));
                    alias
                }
                AssociationKind::ToMany { joins } => {
                    let alias = self.alias_for(&child.table);
                    self.push_join(&child.table, &alias, &parent_alias, joins);
                    alias
                }
                AssociationKind::ManyToMany {
                    bridge_table,
                    parent_to_bridge,
                    bridge_to_child,
                } => {
                    let bridge_alias = self.alias_for(bridge_table);
                    self.push_join(bridge_table, &bridge_alias, &parent_alias, parent_to_bridge);
                    let alias = self.alias_for(&child.table);
                    self.push_join(&child.table, &alias, &bridge_alias, bridge_to_child);
                    alias
                }
            };

            let child_table = child.table.clone();
            let child_slot = self.enter(child, child_alias);
            self.associations.push(PlannedAssociation {
                association: association.clone(),
                parent_slot: slot,
                slot: child_slot,
            });

            self.path.insert(child_table.clone());
            self.walk(child_slot)?;
            self.path.remove(&child_table);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AssociationDef, ColumnDef, Entity, EntityDef};
    use crate::record::Record;
    use crate::registry::tests::Owner;
    use crate::value::FieldType;

    struct Fixture;
    struct Team;
    struct Employee;
    struct Department;
    struct Node;

    impl Entity for Fixture {
        fn definition() -> EntityDef {
            EntityDef::new("fixture")
                .id(ColumnDef::new("id", FieldType::BigInt))
                .association(AssociationDef::to_one::<Team>("home").join_column("home_id"))
                .association(AssociationDef::to_one::<Team>("away").join_column("away_id"))
        }
        fn to_record(&self) -> Record {
            Record::new()
        }
        fn from_record(_: Record) -> Result<Self> {
            Ok(Fixture)
        }
    }

    impl Entity for Team {
        fn definition() -> EntityDef {
            EntityDef::new("team")
                .id(ColumnDef::new("id", FieldType::BigInt))
                .column(ColumnDef::new("name", FieldType::String))
        }
        fn to_record(&self) -> Record {
            Record::new()
        }
        fn from_record(_: Record) -> Result<Self> {
            Ok(Team)
        }
    }

    impl Entity for Employee {
        fn definition() -> EntityDef {
            EntityDef::new("employee")
                .id(ColumnDef::new("id", FieldType::BigInt))
                .column(ColumnDef::new("name", FieldType::String))
                .association(AssociationDef::to_one::<Department>("department").join_column("department_id"))
        }
        fn to_record(&self) -> Record {
            Record::new()
        }
        fn from_record(_: Record) -> Result<Self> {
            Ok(Employee)
        }
    }

    impl Entity for Department {
        fn definition() -> EntityDef {
            EntityDef::new("department")
                .id(ColumnDef::new("id", FieldType::BigInt))
                .column(ColumnDef::new("title", FieldType::String))
                .association(AssociationDef::to_many::<Employee>("employees").join_column("department_id"))
        }
        fn to_record(&self) -> Record {
            Record::new()
        }
        fn from_record(_: Record) -> Result<Self> {
            Ok(Department)
        }
    }

    impl Entity for Node {
        fn definition() -> EntityDef {
            EntityDef::new("node")
                .id(ColumnDef::new("id", FieldType::BigInt))
                .association(AssociationDef::to_one::<Node>("parent").join_column("parent_id"))
                .association(AssociationDef::to_many::<Node>("children").join_column("parent_id"))
        }
        fn to_record(&self) -> Record {
            Record::new()
        }
        fn from_record(_: Record) -> Result<Self> {
            Ok(Node)
        }
    }

    #[test]
    fn test_plan_layout_and_sql() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Owner>().unwrap();

        assert_eq!(
            plan.select_sql(),
            "SELECT owner.id, owner.name, badge.id, badge.code, pet.id, pet.name, club.club_no, club.title \
             FROM owner \
             LEFT JOIN badge ON owner.badge_id = badge.id \
             LEFT JOIN pet ON owner.id = pet.owner_id \
             LEFT JOIN owner_club ON owner.id = owner_club.owner_id \
             LEFT JOIN club ON owner_club.club_id = club.club_no"
        );
        let offsets: Vec<usize> = plan.tables().iter().map(|t| t.offset).collect();
        assert_eq!(offsets, vec![0, 2, 4, 6]);
        assert_eq!(plan.column_count(), 8);

        let parents: Vec<(usize, usize)> = plan
            .associations()
            .iter()
            .map(|a| (a.parent_slot, a.slot))
            .collect();
        assert_eq!(parents, vec![(0, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn test_repeated_table_gets_fresh_alias() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Fixture>().unwrap();
        assert_eq!(
            plan.select_sql(),
            "SELECT fixture.id, team.id, team.name, c2_team.id, c2_team.name \
             FROM fixture \
             LEFT JOIN team ON fixture.home_id = team.id \
             LEFT JOIN team c2_team ON fixture.away_id = c2_team.id"
        );
    }

    #[test]
    fn test_mutual_reference_terminates() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Employee>().unwrap();
        let tables: Vec<&str> = plan.tables().iter().map(|t| t.descriptor.table.as_str()).collect();
        assert_eq!(tables, vec!["employee", "department"]);
        assert_eq!(
            plan.select_sql(),
            "SELECT employee.id, employee.name, department.id, department.title \
             FROM employee \
             LEFT JOIN department ON employee.department_id = department.id"
        );

        let plan = registry.join_plan::<Department>().unwrap();
        let tables: Vec<&str> = plan.tables().iter().map(|t| t.descriptor.table.as_str()).collect();
        assert_eq!(tables, vec!["department", "employee"]);
    }

    #[test]
    fn test_self_reference_terminates() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Node>().unwrap();
        assert_eq!(plan.tables().len(), 1);
        assert!(plan.associations().is_empty());
        assert_eq!(plan.select_sql(), "SELECT node.id FROM node");
    }

    #[test]
    fn test_where_variants() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Team>().unwrap();
        assert_eq!(plan.select_where("team.id = ?"), "SELECT team.id, team.name FROM team WHERE team.id = ?");
        assert_eq!(
            plan.select_distinct_where("1 = 1"),
            "SELECT DISTINCT team.id, team.name FROM team WHERE 1 = 1"
        );
    }
}
