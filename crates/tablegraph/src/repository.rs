//! Typed repository over one root entity.
//!
//! Reads run the root's join plan and rebuild entity graphs. Writes walk the
//! graph with cascading saves or deletes inside a [`TransactionScope`]: a
//! session in auto-commit mode gets its own transaction for the call, while a
//! session already in manual-commit mode is left to its caller.

use chrono::Utc;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::coerce::to_storage;
use crate::entity::Entity;
use crate::executor::{mappers, parse_named_parameters, ExecutorConfig, QueryExecutor};
use crate::persist::Persister;
use crate::plan::JoinPlan;
use crate::reconstruct::find_all;
use crate::record::Record;
use crate::registry::{EntityDescriptor, Registry};
use crate::session::SqlSession;
use crate::transaction::TransactionScope;
use crate::value::{IdValue, SqlValue};
use crate::{Result, TableGraphError};

/// Repository of entities `T` identified by `ID`.
///
/// # Example
///
/// ```rust,ignore
/// let registry = Arc::new(Registry::new());
/// let people: Repository<Person, i64> = Repository::new(Arc::clone(&registry))?;
///
/// let mut session = SqliteSession::memory().await?;
/// let saved = people.save(&mut session, &person).await?;
/// let loaded = people.find_by_id(&mut session, saved.id).await?;
/// ```
pub struct Repository<T: Entity, ID: IdValue> {
    registry: Arc<Registry>,
    descriptor: Arc<EntityDescriptor>,
    plan: Arc<JoinPlan>,
    executor: QueryExecutor,
    _marker: PhantomData<fn() -> (T, ID)>,
}

impl<T: Entity, ID: IdValue> std::fmt::Debug for Repository<T, ID> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("table", &self.descriptor.table)
            .field("executor", &self.executor)
            .finish()
    }
}

impl<T: Entity, ID: IdValue> Repository<T, ID> {
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        Self::with_config(registry, ExecutorConfig::default())
    }

    /// Registers `T`, checks its id type against `ID` and builds its join plan.
    pub fn with_config(registry: Arc<Registry>, config: ExecutorConfig) -> Result<Self> {
        let descriptor = registry.register::<T>()?;
        if descriptor.id.field_type != ID::FIELD_TYPE {
            return Err(TableGraphError::Configuration(format!(
                "entity '{}' declares id '{}' as {:?} but the repository id type is {:?}",
                descriptor.table,
                descriptor.id.field,
                descriptor.id.field_type,
                ID::FIELD_TYPE
            )));
        }
        let plan = registry.join_plan::<T>()?;
        Ok(Self {
            registry,
            descriptor,
            plan,
            executor: QueryExecutor::with_config(config),
            _marker: PhantomData,
        })
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn plan(&self) -> &JoinPlan {
        &self.plan
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    fn id_param(&self, id: ID) -> Result<SqlValue> {
        to_storage(id.into(), &self.descriptor.id, Utc::now())
    }

    fn id_predicate(&self) -> String {
        format!("{}.{} = ?", self.plan.root_alias(), self.descriptor.id.column)
    }

    async fn fetch_records(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<Record>> {
        // Join rows are not roots; a row cap here would cut children out.
        let plan = &self.plan;
        self.executor
            .query_uncapped(session, sql, params, |rows| find_all(plan, &rows))
            .await
    }

    /// Rebuilt roots, at most [`ExecutorConfig::max_rows`] of them.
    async fn fetch_all(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<T>> {
        let mut records = self.fetch_records(session, sql, params).await?;
        if let Some(max_rows) = self.executor.config().max_rows {
            records.truncate(max_rows);
        }
        records.into_iter().map(T::from_record).collect()
    }

    async fn fetch_one(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<T>> {
        let records = self.fetch_records(session, sql, params).await?;
        records.into_iter().next().map(T::from_record).transpose()
    }

    // Reads

    #[instrument(skip_all, fields(table = %self.descriptor.table))]
    pub async fn find_by_id(&self, session: &mut dyn SqlSession, id: ID) -> Result<Option<T>> {
        let key = self.id_param(id)?;
        self.fetch_one(session, &self.plan.select_by_id(), vec![key]).await
    }

    /// First root matching `clause`, written against the plan's table aliases.
    #[instrument(skip(self, session, params), fields(table = %self.descriptor.table))]
    pub async fn find_single_with_where(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<T>> {
        self.fetch_one(session, &self.plan.select_where(clause), params).await
    }

    pub async fn find_single_with_where_named(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<Option<T>> {
        let (clause, params) = parse_named_parameters(clause, params)?;
        self.find_single_with_where(session, &clause, params).await
    }

    /// First root produced by a caller-written SELECT.
    ///
    /// The statement must return the columns of [`JoinPlan::columns_sql`] in
    /// that order.
    #[instrument(skip(self, session, params), fields(table = %self.descriptor.table))]
    pub async fn find_single(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<T>> {
        self.fetch_one(session, sql, params).await
    }

    pub async fn find_single_named(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<Option<T>> {
        let (sql, params) = parse_named_parameters(sql, params)?;
        self.find_single(session, &sql, params).await
    }

    #[instrument(skip_all, fields(table = %self.descriptor.table))]
    pub async fn find_all(&self, session: &mut dyn SqlSession) -> Result<Vec<T>> {
        self.fetch_all(session, &self.plan.select_sql(), Vec::new()).await
    }

    #[instrument(skip(self, session, params), fields(table = %self.descriptor.table))]
    pub async fn find_multiple_with_where(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<T>> {
        self.fetch_all(session, &self.plan.select_where(clause), params).await
    }

    pub async fn find_multiple_with_where_named(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<Vec<T>> {
        let (clause, params) = parse_named_parameters(clause, params)?;
        self.find_multiple_with_where(session, &clause, params).await
    }

    #[instrument(skip(self, session, params), fields(table = %self.descriptor.table))]
    pub async fn find_distinct_with_where(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<T>> {
        self.fetch_all(session, &self.plan.select_distinct_where(clause), params)
            .await
    }

    pub async fn find_distinct_with_where_named(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<Vec<T>> {
        let (clause, params) = parse_named_parameters(clause, params)?;
        self.find_distinct_with_where(session, &clause, params).await
    }

    #[instrument(skip(self, session, params), fields(table = %self.descriptor.table))]
    pub async fn find_multiple(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<T>> {
        self.fetch_all(session, sql, params).await
    }

    pub async fn find_multiple_named(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<Vec<T>> {
        let (sql, params) = parse_named_parameters(sql, params)?;
        self.find_multiple(session, &sql, params).await
    }

    /// True when a row with this id exists in the root table.
    pub async fn has_id(&self, session: &mut dyn SqlSession, id: ID) -> Result<bool> {
        let key = self.id_param(id)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            self.descriptor.id.column, self.descriptor.table, self.descriptor.id.column
        );
        let found = self
            .executor
            .query_uncapped(session, &sql, vec![key], mappers::array())
            .await?;
        Ok(found.is_some())
    }

    // Writes

    /// Saves the entity graph and returns the root as stored.
    #[instrument(skip_all, fields(table = %self.descriptor.table))]
    pub async fn save(&self, session: &mut dyn SqlSession, entity: &T) -> Result<T> {
        let record = entity.to_record();
        let scope = TransactionScope::begin(session).await?;
        let result = self.save_record(session, &record).await;
        scope.finish(session, result).await
    }

    /// Saves every entity in one transaction; results keep the input order.
    #[instrument(skip_all, fields(table = %self.descriptor.table, count = entities.len()))]
    pub async fn save_all(&self, session: &mut dyn SqlSession, entities: &[T]) -> Result<Vec<T>> {
        let scope = TransactionScope::begin(session).await?;
        let result = self.save_records(session, entities).await;
        scope.finish(session, result).await
    }

    async fn save_records(&self, session: &mut dyn SqlSession, entities: &[T]) -> Result<Vec<T>> {
        let mut saved = Vec::with_capacity(entities.len());
        for entity in entities {
            saved.push(self.save_record(session, &entity.to_record()).await?);
        }
        Ok(saved)
    }

    async fn save_record(&self, session: &mut dyn SqlSession, record: &Record) -> Result<T> {
        let persister = Persister::new(&self.registry, &self.executor);
        let key = persister.save_graph(session, &self.plan, record).await?;
        let stored = persister.load(session, &self.plan, key.clone()).await?;
        let stored = stored.ok_or_else(|| {
            TableGraphError::Internal(format!(
                "saved '{}' row {} could not be reloaded",
                self.descriptor.table, key
            ))
        })?;
        T::from_record(stored)
    }

    /// Deletes the graph rooted at `id`; returns the number of roots deleted.
    pub async fn delete_by_id(&self, session: &mut dyn SqlSession, id: ID) -> Result<u64> {
        let key = self.id_param(id)?;
        let clause = self.id_predicate();
        self.delete_where(session, &clause, vec![key]).await
    }

    /// Deletes every graph whose root matches `clause`.
    #[instrument(skip(self, session, params), fields(table = %self.descriptor.table))]
    pub async fn delete_where(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: Vec<SqlValue>,
    ) -> Result<u64> {
        let scope = TransactionScope::begin(session).await?;
        let result = self.delete_records(session, clause, params).await;
        scope.finish(session, result).await
    }

    pub async fn delete_where_named(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<u64> {
        let (clause, params) = parse_named_parameters(clause, params)?;
        self.delete_where(session, &clause, params).await
    }

    async fn delete_records(
        &self,
        session: &mut dyn SqlSession,
        clause: &str,
        params: Vec<SqlValue>,
    ) -> Result<u64> {
        let records = self
            .fetch_records(session, &self.plan.select_where(clause), params)
            .await?;
        let persister = Persister::new(&self.registry, &self.executor);
        for record in &records {
            persister
                .delete_graph(session, Arc::clone(&self.descriptor), record)
                .await?;
        }
        debug!(table = %self.descriptor.table, deleted = records.len(), "Deleted entity graphs");
        Ok(records.len() as u64)
    }
}
