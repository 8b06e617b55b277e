//! Cascading save and delete of entity graphs.
//!
//! A save walks the input graph alongside the graph currently stored under
//! the same root id. To-one children are written before their parent, since
//! the parent row carries their key; collections are diffed by id after the
//! parent row is written. A delete removes bridge rows first, then cascaded
//! collections, then the entity's own row, then cascaded to-one targets.
//!
//! Nothing here opens or closes a transaction; the repository wraps every
//! top-level call in a [`TransactionScope`](crate::TransactionScope).

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::coerce::to_storage;
use crate::entity::SaveMode;
use crate::executor::{mappers, QueryExecutor};
use crate::plan::JoinPlan;
use crate::reconstruct::find_one;
use crate::record::Record;
use crate::registry::{AssociationKind, ColumnJoin, EntityDescriptor, Registry};
use crate::session::{SqlRow, SqlSession};
use crate::value::{IdKey, SqlValue};
use crate::{Result, TableGraphError};

/// Column values of one table row in storage form.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RowValues(Vec<(String, SqlValue)>);

impl RowValues {
    pub(crate) fn get(&self, column: &str) -> Option<&SqlValue> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    /// The value of `column`, NULL when absent.
    pub(crate) fn value(&self, column: &str) -> SqlValue {
        self.get(column).cloned().unwrap_or(SqlValue::Null)
    }

    pub(crate) fn set(&mut self, column: &str, value: SqlValue) {
        match self.0.iter_mut().find(|(name, _)| name.eq_ignore_ascii_case(column)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((column.to_string(), value)),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl From<SqlRow> for RowValues {
    fn from(row: SqlRow) -> Self {
        let columns = row.columns().to_vec();
        Self(columns.into_iter().zip(row.into_values()).collect())
    }
}

fn record_id(descriptor: &EntityDescriptor, record: &Record) -> SqlValue {
    record
        .get_value(&descriptor.id.field)
        .cloned()
        .unwrap_or(SqlValue::Null)
}

fn id_key(descriptor: &EntityDescriptor, record: &Record) -> Option<IdKey> {
    record_id(descriptor, record).id_key()
}

/// Bridge columns and values linking `parent` to `child`.
fn bridge_values(
    parent_to_bridge: &[ColumnJoin],
    bridge_to_child: &[ColumnJoin],
    parent: &RowValues,
    child: &RowValues,
) -> Vec<(String, SqlValue)> {
    parent_to_bridge
        .iter()
        .map(|join| (join.child_column.clone(), parent.value(&join.parent_column)))
        .chain(
            bridge_to_child
                .iter()
                .map(|join| (join.parent_column.clone(), child.value(&join.child_column))),
        )
        .collect()
}

fn conjunction(columns: &[(String, SqlValue)]) -> String {
    columns
        .iter()
        .map(|(column, _)| format!("{} = ?", column))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Walks entity graphs for one top-level save or delete.
pub(crate) struct Persister<'a> {
    registry: &'a Registry,
    executor: &'a QueryExecutor,
    /// Stamp written into system-managed columns.
    now: DateTime<Utc>,
}

impl<'a> Persister<'a> {
    pub(crate) fn new(registry: &'a Registry, executor: &'a QueryExecutor) -> Self {
        Self {
            registry,
            executor,
            now: Utc::now(),
        }
    }

    /// Loads the stored graph rooted at `key` (a storage-form id).
    pub(crate) async fn load(
        &self,
        session: &mut dyn SqlSession,
        plan: &JoinPlan,
        key: SqlValue,
    ) -> Result<Option<Record>> {
        self.executor
            .query_uncapped(session, &plan.select_by_id(), vec![key], |rows| {
                find_one(plan, &rows)
            })
            .await
    }

    /// Saves `input` and everything its cascades reach; returns the stored root id.
    pub(crate) async fn save_graph(
        &self,
        session: &mut dyn SqlSession,
        plan: &JoinPlan,
        input: &Record,
    ) -> Result<SqlValue> {
        let descriptor = Arc::clone(&plan.root().descriptor);
        let id = record_id(&descriptor, input);
        let existing = if id.is_null() {
            None
        } else {
            let key = to_storage(id, &descriptor.id, self.now)?;
            self.load(session, plan, key).await?
        };

        let mode = if existing.is_some() {
            SaveMode::Merge
        } else {
            SaveMode::Persist
        };
        debug!(table = %descriptor.table, mode = %mode, "Saving entity graph");

        let stored = self
            .save_node(
                session,
                Arc::clone(&descriptor),
                existing.as_ref(),
                input,
                mode,
                Vec::new(),
            )
            .await?;
        Ok(stored.value(&descriptor.id.column))
    }

    /// Deletes `record` and everything its remove cascades reach.
    pub(crate) async fn delete_graph(
        &self,
        session: &mut dyn SqlSession,
        descriptor: Arc<EntityDescriptor>,
        record: &Record,
    ) -> Result<()> {
        debug!(table = %descriptor.table, "Deleting entity graph");
        self.delete_node(session, descriptor, record).await
    }

    /// Storage values of every column the entity's row holds.
    ///
    /// A to-one foreign key that is not also a mapped scalar comes from the
    /// referenced column of the child record, or NULL when there is no child.
    fn row_data(&self, descriptor: &EntityDescriptor, record: &Record) -> Result<RowValues> {
        let mut row = RowValues::default();
        for field in std::iter::once(&descriptor.id).chain(descriptor.columns.iter()) {
            let value = record.get_value(&field.field).cloned().unwrap_or(SqlValue::Null);
            row.set(&field.column, to_storage(value, field, self.now)?);
        }

        for association in &descriptor.to_one {
            let AssociationKind::ToOne { join } = &association.kind else {
                continue;
            };
            if row.get(&join.parent_column).is_some_and(|v| !v.is_null()) {
                continue;
            }
            let value = match record.one(&association.field) {
                Some(child) => {
                    let child_descriptor = self.registry.get(&association.child_table)?;
                    match child_descriptor.field_for_column(&join.child_column) {
                        Some(field) => {
                            let value = child.get_value(&field.field).cloned().unwrap_or(SqlValue::Null);
                            to_storage(value, field, self.now)?
                        }
                        None => SqlValue::Null,
                    }
                }
                None => SqlValue::Null,
            };
            row.set(&join.parent_column, value);
        }
        Ok(row)
    }

    fn save_node<'s>(
        &'s self,
        session: &'s mut dyn SqlSession,
        descriptor: Arc<EntityDescriptor>,
        existing: Option<&'s Record>,
        input: &'s Record,
        mode: SaveMode,
        overrides: Vec<(String, SqlValue)>,
    ) -> BoxFuture<'s, Result<RowValues>> {
        async move {
            let mut row = self.row_data(&descriptor, input)?;

            // To-one children first: this row stores their keys.
            let mut retired: Vec<(Arc<EntityDescriptor>, &'s Record)> = Vec::new();
            for association in &descriptor.to_one {
                let AssociationKind::ToOne { join } = &association.kind else {
                    continue;
                };
                if !association.cascade.covers(mode) {
                    continue;
                }
                let child_descriptor = self.registry.get(&association.child_table)?;
                let old = existing.and_then(|e| e.one(&association.field));
                let new = input.one(&association.field);

                let saved = match (old, new) {
                    (Some(old), Some(new))
                        if id_key(&child_descriptor, old).is_some()
                            && id_key(&child_descriptor, old) == id_key(&child_descriptor, new) =>
                    {
                        Some(
                            self.save_node(session, Arc::clone(&child_descriptor), Some(old), new, mode, Vec::new())
                                .await?,
                        )
                    }
                    (old, Some(new)) => {
                        if let Some(old) = old {
                            retired.push((Arc::clone(&child_descriptor), old));
                        }
                        Some(
                            self.save_node(session, Arc::clone(&child_descriptor), None, new, mode, Vec::new())
                                .await?,
                        )
                    }
                    (Some(old), None) => {
                        retired.push((Arc::clone(&child_descriptor), old));
                        None
                    }
                    (None, None) => None,
                };
                let key = saved
                    .map(|stored| stored.value(&join.child_column))
                    .unwrap_or(SqlValue::Null);
                row.set(&join.parent_column, key);
            }

            for (column, value) in overrides {
                row.set(&column, value);
            }

            let stored = self.save_row(session, &descriptor, row).await?;

            // Replaced to-one children are no longer referenced by this row.
            for (child_descriptor, old) in retired {
                self.delete_node(session, child_descriptor, old).await?;
            }

            for association in &descriptor.to_many {
                let child_descriptor = self.registry.get(&association.child_table)?;
                let old_children: &[Record] = existing.map(|e| e.many(&association.field)).unwrap_or(&[]);
                let mut pending: Vec<&'s Record> = input.many(&association.field).iter().collect();

                match &association.kind {
                    AssociationKind::ToMany { joins } => {
                        if !association.cascade.covers(mode) {
                            continue;
                        }
                        let back_reference: Vec<(String, SqlValue)> = joins
                            .iter()
                            .map(|join| (join.child_column.clone(), stored.value(&join.parent_column)))
                            .collect();

                        for old in old_children {
                            match take_matching(&child_descriptor, &mut pending, old) {
                                Some(new) => {
                                    self.save_node(
                                        session,
                                        Arc::clone(&child_descriptor),
                                        Some(old),
                                        new,
                                        mode,
                                        back_reference.clone(),
                                    )
                                    .await?;
                                }
                                None => {
                                    self.delete_node(session, Arc::clone(&child_descriptor), old).await?;
                                }
                            }
                        }
                        for new in pending {
                            self.save_node(
                                session,
                                Arc::clone(&child_descriptor),
                                None,
                                new,
                                mode,
                                back_reference.clone(),
                            )
                            .await?;
                        }
                    }
                    AssociationKind::ManyToMany {
                        bridge_table,
                        parent_to_bridge,
                        bridge_to_child,
                    } => {
                        let cascades = association.cascade.covers(mode);
                        for old in old_children {
                            let old_row = self.row_data(&child_descriptor, old)?;
                            let link = bridge_values(parent_to_bridge, bridge_to_child, &stored, &old_row);
                            match take_matching(&child_descriptor, &mut pending, old) {
                                None => {
                                    self.delete_bridge_rows(session, bridge_table, &link).await?;
                                    if association.cascade.removes() {
                                        self.delete_node(session, Arc::clone(&child_descriptor), old).await?;
                                    }
                                }
                                Some(new) if cascades => {
                                    self.delete_bridge_rows(session, bridge_table, &link).await?;
                                    let child_stored = self
                                        .save_node(
                                            session,
                                            Arc::clone(&child_descriptor),
                                            Some(old),
                                            new,
                                            mode,
                                            Vec::new(),
                                        )
                                        .await?;
                                    let link =
                                        bridge_values(parent_to_bridge, bridge_to_child, &stored, &child_stored);
                                    self.insert_bridge_row(session, bridge_table, &link).await?;
                                }
                                Some(_) => {}
                            }
                        }

                        for new in pending {
                            let child_row = if cascades {
                                self.save_node(
                                    session,
                                    Arc::clone(&child_descriptor),
                                    None,
                                    new,
                                    mode,
                                    Vec::new(),
                                )
                                .await?
                            } else {
                                // Link an already stored child without saving it.
                                let child_row = self.row_data(&child_descriptor, new)?;
                                let id = child_row.value(&child_descriptor.id.column);
                                if id.is_null() || !self.id_present(session, &child_descriptor, &id).await? {
                                    trace!(
                                        table = %child_descriptor.table,
                                        "Skipping link to unsaved child"
                                    );
                                    continue;
                                }
                                child_row
                            };
                            let link = bridge_values(parent_to_bridge, bridge_to_child, &stored, &child_row);
                            self.insert_bridge_row(session, bridge_table, &link).await?;
                        }
                    }
                    AssociationKind::ToOne { .. } => {}
                }
            }

            Ok(stored)
        }
        .boxed()
    }

    fn delete_node<'s>(
        &'s self,
        session: &'s mut dyn SqlSession,
        descriptor: Arc<EntityDescriptor>,
        record: &'s Record,
    ) -> BoxFuture<'s, Result<()>> {
        async move {
            let row = self.row_data(&descriptor, record)?;

            for association in &descriptor.to_many {
                if let AssociationKind::ManyToMany {
                    bridge_table,
                    parent_to_bridge,
                    ..
                } = &association.kind
                {
                    let filter: Vec<(String, SqlValue)> = parent_to_bridge
                        .iter()
                        .map(|join| (join.child_column.clone(), row.value(&join.parent_column)))
                        .collect();
                    self.delete_bridge_rows(session, bridge_table, &filter).await?;
                }
            }

            for association in descriptor.to_many.iter().filter(|a| a.cascade.removes()) {
                let child_descriptor = self.registry.get(&association.child_table)?;
                for child in record.many(&association.field) {
                    self.delete_node(session, Arc::clone(&child_descriptor), child).await?;
                }
            }

            let id_column = &descriptor.id.column;
            let sql = format!("DELETE FROM {} WHERE {} = ?", descriptor.table, id_column);
            let affected = self
                .executor
                .execute(session, &sql, &[row.value(id_column)])
                .await?;
            trace!(table = %descriptor.table, rows = affected, "Deleted row");

            for association in descriptor.to_one.iter().filter(|a| a.cascade.removes()) {
                if let Some(child) = record.one(&association.field) {
                    let child_descriptor = self.registry.get(&association.child_table)?;
                    self.delete_node(session, child_descriptor, child).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Inserts or updates one row by database presence, then re-reads it.
    async fn save_row(
        &self,
        session: &mut dyn SqlSession,
        descriptor: &EntityDescriptor,
        row: RowValues,
    ) -> Result<RowValues> {
        let id = row.value(&descriptor.id.column);
        let key = if !id.is_null() && self.id_present(session, descriptor, &id).await? {
            self.update_row(session, descriptor, &row, &id).await?;
            id
        } else {
            self.insert_row(session, descriptor, &row).await?
        };
        self.reload(session, descriptor, key).await
    }

    async fn id_present(
        &self,
        session: &mut dyn SqlSession,
        descriptor: &EntityDescriptor,
        id: &SqlValue,
    ) -> Result<bool> {
        let id_column = &descriptor.id.column;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            id_column, descriptor.table, id_column
        );
        let found = self
            .executor
            .query_uncapped(session, &sql, vec![id.clone()], mappers::array())
            .await?;
        Ok(found.is_some())
    }

    async fn insert_row(
        &self,
        session: &mut dyn SqlSession,
        descriptor: &EntityDescriptor,
        row: &RowValues,
    ) -> Result<SqlValue> {
        let id_column = descriptor.id.column.as_str();
        let (columns, params): (Vec<&str>, Vec<SqlValue>) = row
            .iter()
            .filter(|(column, value)| !(*column == id_column && value.is_null()))
            .map(|(column, value)| (column, value.clone()))
            .unzip();

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", descriptor.table)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                descriptor.table,
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };

        let key = self
            .executor
            .insert_returning(session, &sql, &[id_column], &params)
            .await?;
        let key = if key.is_null() { row.value(id_column) } else { key };
        if key.is_null() {
            return Err(TableGraphError::Internal(format!(
                "insert into '{}' produced no id",
                descriptor.table
            )));
        }
        trace!(table = %descriptor.table, id = %key, "Inserted row");
        Ok(key)
    }

    /// Updates the row unless every compared column already matches.
    ///
    /// System-managed columns are left out of the comparison but are
    /// written when the update happens.
    async fn update_row(
        &self,
        session: &mut dyn SqlSession,
        descriptor: &EntityDescriptor,
        row: &RowValues,
        id: &SqlValue,
    ) -> Result<()> {
        let id_column = descriptor.id.column.as_str();
        let compared: Vec<(String, SqlValue)> = row
            .iter()
            .filter(|(column, _)| !descriptor.system_managed.contains(*column))
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            id_column,
            descriptor.table,
            conjunction(&compared)
        );
        let params = compared.into_iter().map(|(_, value)| value).collect();
        let unchanged = self
            .executor
            .query_uncapped(session, &sql, params, mappers::array())
            .await?
            .is_some();
        if unchanged {
            debug!(table = %descriptor.table, id = %id, "Row unchanged, update skipped");
            return Ok(());
        }

        let (assignments, mut params): (Vec<String>, Vec<SqlValue>) = row
            .iter()
            .filter(|(column, _)| *column != id_column)
            .map(|(column, value)| (format!("{} = ?", column), value.clone()))
            .unzip();
        if assignments.is_empty() {
            return Ok(());
        }
        params.push(id.clone());
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            descriptor.table,
            assignments.join(", "),
            id_column
        );
        let affected = self.executor.execute(session, &sql, &params).await?;
        if affected == 0 {
            return Err(TableGraphError::Stale(format!(
                "update of '{}' id {} matched no row",
                descriptor.table, id
            )));
        }
        Ok(())
    }

    async fn reload(
        &self,
        session: &mut dyn SqlSession,
        descriptor: &EntityDescriptor,
        key: SqlValue,
    ) -> Result<RowValues> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            descriptor.database_columns.join(", "),
            descriptor.table,
            descriptor.id.column
        );
        let stored = self
            .executor
            .query_uncapped(session, &sql, vec![key.clone()], |rows| {
                Ok(rows.into_iter().next().map(RowValues::from))
            })
            .await?;
        stored.ok_or_else(|| {
            TableGraphError::Internal(format!(
                "row {} of '{}' not found after save",
                key, descriptor.table
            ))
        })
    }

    /// Deletes bridge rows matching every filter column.
    ///
    /// A NULL key matches no row under `=`, so a filter holding one is
    /// skipped rather than issued.
    async fn delete_bridge_rows(
        &self,
        session: &mut dyn SqlSession,
        bridge_table: &str,
        filter: &[(String, SqlValue)],
    ) -> Result<u64> {
        if filter.is_empty() || filter.iter().any(|(_, value)| value.is_null()) {
            trace!(table = %bridge_table, "Bridge key absent, nothing to unlink");
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE {}", bridge_table, conjunction(filter));
        let params: Vec<SqlValue> = filter.iter().map(|(_, value)| value.clone()).collect();
        self.executor.execute(session, &sql, &params).await
    }

    async fn insert_bridge_row(
        &self,
        session: &mut dyn SqlSession,
        bridge_table: &str,
        values: &[(String, SqlValue)],
    ) -> Result<u64> {
        let columns: Vec<&str> = values.iter().map(|(column, _)| column.as_str()).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            bridge_table,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        let params: Vec<SqlValue> = values.iter().map(|(_, value)| value.clone()).collect();
        self.executor.execute(session, &sql, &params).await
    }
}

/// Removes and returns the pending input child with the same id as `old`.
fn take_matching<'r>(
    descriptor: &EntityDescriptor,
    pending: &mut Vec<&'r Record>,
    old: &Record,
) -> Option<&'r Record> {
    let key = id_key(descriptor, old)?;
    let index = pending
        .iter()
        .position(|candidate| id_key(descriptor, candidate).as_ref() == Some(&key))?;
    Some(pending.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_row_values_case_insensitive() {
        let mut row = RowValues::default();
        row.set("owner_id", SqlValue::BigInt(1));
        row.set("OWNER_ID", SqlValue::BigInt(2));
        assert_eq!(row.value("Owner_Id"), SqlValue::BigInt(2));
        assert_eq!(row.value("missing"), SqlValue::Null);
        assert_eq!(row.iter().count(), 1);
    }

    #[test]
    fn test_row_values_from_sql_row() {
        let columns = Arc::new(vec!["id".to_string(), "name".to_string()]);
        let row = RowValues::from(SqlRow::new(columns, vec![SqlValue::BigInt(3), SqlValue::from("x")]));
        assert_eq!(row.value("id"), SqlValue::BigInt(3));
        assert_eq!(row.value("name"), SqlValue::from("x"));
    }

    #[test]
    fn test_bridge_values_map_both_sides() {
        let parent_to_bridge = vec![ColumnJoin {
            parent_column: "id".to_string(),
            child_column: "owner_id".to_string(),
        }];
        let bridge_to_child = vec![ColumnJoin {
            parent_column: "club_id".to_string(),
            child_column: "club_no".to_string(),
        }];
        let mut parent = RowValues::default();
        parent.set("id", SqlValue::BigInt(1));
        let mut child = RowValues::default();
        child.set("club_no", SqlValue::BigInt(9));

        let values = bridge_values(&parent_to_bridge, &bridge_to_child, &parent, &child);
        assert_eq!(
            values,
            vec![
                ("owner_id".to_string(), SqlValue::BigInt(1)),
                ("club_id".to_string(), SqlValue::BigInt(9)),
            ]
        );
        assert_eq!(conjunction(&values), "owner_id = ? AND club_id = ?");
    }

    #[tokio::test]
    async fn test_bridge_delete_without_key_is_skipped() {
        let registry = Registry::new();
        let executor = QueryExecutor::new();
        let persister = Persister::new(&registry, &executor);
        let mut session = crate::session::SqliteSession::memory().await.unwrap();

        // The table does not exist, so any issued statement would fail.
        let filter = vec![("owner_id".to_string(), SqlValue::Null)];
        let deleted = persister
            .delete_bridge_rows(&mut session, "missing_bridge", &filter)
            .await
            .unwrap();
        assert_eq!(deleted, 0);

        let filter = vec![("owner_id".to_string(), SqlValue::BigInt(1))];
        assert!(persister
            .delete_bridge_rows(&mut session, "missing_bridge", &filter)
            .await
            .is_err());
    }

    #[test]
    fn test_take_matching_by_id() {
        let registry = Registry::new();
        let descriptor = registry.register::<crate::registry::tests::Pet>().unwrap();
        let a = Record::new().with("id", 1i64);
        let b = Record::new().with("id", 2i64);
        let fresh = Record::new();
        let mut pending = vec![&a, &fresh, &b];

        let old = Record::new().with("id", 2i32);
        let matched = take_matching(&descriptor, &mut pending, &old).unwrap();
        assert_eq!(matched.get_value("id"), Some(&SqlValue::BigInt(2)));
        assert_eq!(pending.len(), 2);

        assert!(take_matching(&descriptor, &mut pending, &Record::new()).is_none());
    }
}
