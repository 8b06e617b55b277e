//! Graph reconstruction from flat join rows.
//!
//! Rows produced by a [`JoinPlan`] repeat parent columns once per joined
//! child. The [`GraphBuilder`] keeps one node per `(table, id)` for the whole
//! result, records every `(association, parent)` pair a node was seen under,
//! and only links nodes into records after the last row.
//!
//! Linking walks tables in reverse first-seen order so a collection is only
//! handed to its parent once its own members are complete. Single-valued
//! fields keep the first child linked to them.

use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::coerce::from_storage;
use crate::entity::Container;
use crate::plan::JoinPlan;
use crate::record::Record;
use crate::session::SqlRow;
use crate::value::{IdKey, SqlValue};
use crate::{Result, TableGraphError};

struct Node {
    key: IdKey,
    record: Record,
    /// `(plan association index, parent node)` pairs, unique by parent field.
    links: Vec<(usize, usize)>,
}

/// Incremental builder of the entity graph behind one query result.
pub struct GraphBuilder<'p> {
    plan: &'p JoinPlan,
    nodes: Vec<Node>,
    index: HashMap<(String, IdKey), usize>,
    table_order: Vec<String>,
    table_nodes: HashMap<String, Vec<usize>>,
    roots: Vec<usize>,
}

impl<'p> GraphBuilder<'p> {
    pub fn new(plan: &'p JoinPlan) -> Self {
        Self {
            plan,
            nodes: Vec::new(),
            index: HashMap::new(),
            table_order: Vec::new(),
            table_nodes: HashMap::new(),
            roots: Vec::new(),
        }
    }

    /// Consumes one result row.
    pub fn push_row(&mut self, row: &[SqlValue]) -> Result<()> {
        let plan = self.plan;
        let expected = plan.column_count();
        if row.len() < expected {
            return Err(TableGraphError::Query(format!(
                "result row has {} columns, the join on '{}' produces {}",
                row.len(),
                plan.root_table(),
                expected
            )));
        }

        let mut slot_nodes: Vec<Option<usize>> = vec![None; plan.tables().len()];

        let Some((root, created)) = self.node_at(0, row)? else {
            return Ok(());
        };
        if created {
            self.roots.push(root);
        }
        slot_nodes[0] = Some(root);

        for (index, planned) in plan.associations().iter().enumerate() {
            let Some(parent) = slot_nodes[planned.parent_slot] else {
                continue;
            };
            // A NULL child id is an outer-join miss for this branch only.
            let Some((child, _)) = self.node_at(planned.slot, row)? else {
                continue;
            };
            slot_nodes[planned.slot] = Some(child);

            let field = &planned.association.field;
            let already_linked = self.nodes[child].links.iter().any(|&(other, other_parent)| {
                other_parent == parent && plan.associations()[other].association.field == *field
            });
            if !already_linked {
                self.nodes[child].links.push((index, parent));
            }
        }
        Ok(())
    }

    /// Fetches or creates the node whose id sits in `slot`'s columns.
    fn node_at(&mut self, slot: usize, row: &[SqlValue]) -> Result<Option<(usize, bool)>> {
        let plan = self.plan;
        let planned = &plan.tables()[slot];
        let descriptor = &planned.descriptor;

        let id = from_storage(row[planned.offset].clone(), &descriptor.id)?;
        let Some(key) = id.id_key() else {
            return Ok(None);
        };
        let index_key = (descriptor.table.clone(), key);
        if let Some(&existing) = self.index.get(&index_key) {
            return Ok(Some((existing, false)));
        }

        let mut record = Record::new().with(descriptor.id.field.clone(), id);
        for (i, field) in descriptor.columns.iter().enumerate() {
            let value = from_storage(row[planned.offset + 1 + i].clone(), field)?;
            record.set(field.field.clone(), value);
        }
        for association in descriptor.to_one.iter() {
            record.set_one(association.field.clone(), None);
        }
        for field in &descriptor.collection_fields {
            record.set_many(field.clone(), Vec::new());
        }

        let node = self.nodes.len();
        let table = descriptor.table.clone();
        self.nodes.push(Node {
            key: index_key.1.clone(),
            record,
            links: Vec::new(),
        });
        self.index.insert(index_key, node);
        match self.table_nodes.get_mut(&table) {
            Some(nodes) => nodes.push(node),
            None => {
                self.table_order.push(table.clone());
                self.table_nodes.insert(table, vec![node]);
            }
        }
        Ok(Some((node, true)))
    }

    /// Links every node and materializes the distinct roots in first-seen order.
    pub fn finish(self) -> Vec<Record> {
        let mut children: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.nodes.len()];
        for table in self.table_order.iter().rev() {
            let Some(nodes) = self.table_nodes.get(table) else {
                continue;
            };
            for &child in nodes {
                for &(association, parent) in &self.nodes[child].links {
                    children[parent].push((association, child));
                }
            }
        }

        trace!(
            root = %self.plan.root_table(),
            nodes = self.nodes.len(),
            roots = self.roots.len(),
            "Reconstructed entity graph"
        );

        let mut path = HashSet::new();
        self.roots
            .iter()
            .map(|&root| self.materialize(root, &children, &mut path))
            .collect()
    }

    fn materialize(
        &self,
        node: usize,
        children: &[Vec<(usize, usize)>],
        path: &mut HashSet<usize>,
    ) -> Record {
        let mut record = self.nodes[node].record.clone();
        path.insert(node);

        let mut collections: Vec<(&str, Container, Vec<(&IdKey, Record)>)> = Vec::new();
        for &(association, child) in &children[node] {
            // A node already on the path is a back reference; cut it.
            if path.contains(&child) {
                continue;
            }
            let descriptor = &self.plan.associations()[association].association;
            match descriptor.container {
                Some(container) => {
                    let child_record = self.materialize(child, children, path);
                    let entry = (&self.nodes[child].key, child_record);
                    match collections.iter_mut().find(|(f, _, _)| *f == descriptor.field) {
                        Some((_, _, members)) => members.push(entry),
                        None => collections.push((descriptor.field.as_str(), container, vec![entry])),
                    }
                }
                None => {
                    if record.one(&descriptor.field).is_none() {
                        let child_record = self.materialize(child, children, path);
                        record.set_one(descriptor.field.clone(), Some(child_record));
                    }
                }
            }
        }

        for (field, container, mut members) in collections {
            if container == Container::SortedSet {
                members.sort_by(|a, b| a.0.cmp(b.0));
            }
            record.set_many(field, members.into_iter().map(|(_, r)| r).collect());
        }

        path.remove(&node);
        record
    }
}

/// Rebuilds every distinct root entity found in `rows`.
pub fn find_all(plan: &JoinPlan, rows: &[SqlRow]) -> Result<Vec<Record>> {
    let mut builder = GraphBuilder::new(plan);
    for row in rows {
        builder.push_row(row.values())?;
    }
    Ok(builder.finish())
}

/// Rebuilds the first root entity found in `rows`.
pub fn find_one(plan: &JoinPlan, rows: &[SqlRow]) -> Result<Option<Record>> {
    Ok(find_all(plan, rows)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::Owner;
    use crate::registry::Registry;

    fn s(v: &str) -> SqlValue {
        SqlValue::String(v.to_string())
    }

    fn row(values: Vec<SqlValue>) -> SqlRow {
        SqlRow::new(Vec::new().into(), values)
    }

    fn owner_rows() -> Vec<SqlRow> {
        use SqlValue::{BigInt as I, Null};
        vec![
            row(vec![I(1), s("ann"), I(10), s("B"), I(100), s("rex"), I(7), s("chess")]),
            row(vec![I(1), s("ann"), I(10), s("B"), I(100), s("rex"), I(8), s("go")]),
            row(vec![I(1), s("ann"), I(10), s("B"), I(101), s("tom"), I(7), s("chess")]),
            row(vec![I(1), s("ann"), I(10), s("B"), I(101), s("tom"), I(8), s("go")]),
            row(vec![I(2), s("bob"), Null, Null, Null, Null, Null, Null]),
        ]
    }

    #[test]
    fn test_fan_out_rows_collapse_to_one_root() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Owner>().unwrap();
        let roots = find_all(&plan, &owner_rows()).unwrap();

        assert_eq!(roots.len(), 2);
        let ann = &roots[0];
        assert_eq!(ann.get::<String>("name").unwrap(), "ann");
        assert_eq!(ann.one("badge").unwrap().get::<String>("code").unwrap(), "B");

        let pets: Vec<i64> = ann.many("pets").iter().map(|p| p.get("id").unwrap()).collect();
        assert_eq!(pets, vec![100, 101]);
        let clubs: Vec<i64> = ann.many("clubs").iter().map(|c| c.get("id").unwrap()).collect();
        assert_eq!(clubs, vec![7, 8]);
    }

    #[test]
    fn test_outer_join_misses_leave_empty_fields() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Owner>().unwrap();
        let roots = find_all(&plan, &owner_rows()).unwrap();

        let bob = &roots[1];
        assert_eq!(bob.get::<i64>("id").unwrap(), 2);
        assert!(bob.one("badge").is_none());
        assert!(bob.many("pets").is_empty());
        assert!(matches!(bob.related("clubs"), Some(crate::record::Related::Many(v)) if v.is_empty()));
    }

    #[test]
    fn test_find_one_takes_first_root() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Owner>().unwrap();
        let first = find_one(&plan, &owner_rows()).unwrap().unwrap();
        assert_eq!(first.get::<i64>("id").unwrap(), 1);
        assert!(find_one(&plan, &[]).unwrap().is_none());
    }

    #[test]
    fn test_short_row_is_rejected() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Owner>().unwrap();
        let err = find_all(&plan, &[row(vec![SqlValue::BigInt(1)])]).unwrap_err();
        assert!(matches!(err, TableGraphError::Query(_)));
    }

    #[test]
    fn test_ids_of_different_widths_are_one_node() {
        let registry = Registry::new();
        let plan = registry.join_plan::<Owner>().unwrap();
        let mut rows = owner_rows();
        rows.truncate(2);
        let mut values = rows[1].values().to_vec();
        values[0] = SqlValue::Int(1);
        rows[1] = row(values);

        let roots = find_all(&plan, &rows).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].many("clubs").len(), 2);
    }
}
