//! Shared model, schema and session helpers for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::Path;

use tablegraph::{
    AssociationDef, Backend, Cascade, ColumnDef, Container, Entity, EntityDef, FieldType,
    JoinColumn, JoinTable, Record, Result, SqlRow, SqlSession, SqlValue, SqliteSession, TableGraphError,
    YesNoConverter,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: Option<i64>,
    pub name: String,
    pub active: bool,
    pub updated_at: Option<NaiveDateTime>,
    pub address: Option<Address>,
    pub phones: Vec<Phone>,
    pub tags: Vec<Tag>,
}

impl Person {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            active: true,
            updated_at: None,
            address: None,
            phones: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn phone_numbers(&self) -> Vec<String> {
        let mut numbers: Vec<String> = self.phones.iter().map(|p| p.number.clone()).collect();
        numbers.sort();
        numbers
    }

    pub fn tag_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.tags.iter().map(|t| t.label.clone()).collect();
        labels.sort();
        labels
    }
}

impl Entity for Person {
    fn definition() -> EntityDef {
        EntityDef::new("person")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("name", FieldType::String))
            .column(ColumnDef::new("active", FieldType::Bool).converter(YesNoConverter))
            .column(ColumnDef::new("updated_at", FieldType::Timestamp).system_managed())
            .association(
                AssociationDef::to_one::<Address>("address")
                    .join_column("address_id")
                    .cascade([Cascade::All]),
            )
            .association(
                AssociationDef::to_many::<Phone>("phones")
                    .join_column("person_id")
                    .cascade([Cascade::All]),
            )
            .association(
                AssociationDef::many_to_many::<Tag>("tags")
                    .join_table(
                        JoinTable::new("person_tag")
                            .join_column(JoinColumn::new("person_id"))
                            .inverse_join_column(JoinColumn::new("tag_id")),
                    )
                    .cascade([Cascade::Persist, Cascade::Merge]),
            )
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
            .with("active", self.active)
            .with("updated_at", self.updated_at)
            .with_one("address", self.address.as_ref().map(Entity::to_record))
            .with_many("phones", self.phones.iter().map(Entity::to_record).collect())
            .with_many("tags", self.tags.iter().map(Entity::to_record).collect())
    }

    fn from_record(mut record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            name: record.get("name")?,
            active: record.get("active")?,
            updated_at: record.get("updated_at")?,
            address: record.take_one("address")?,
            phones: record.take_many("phones")?,
            tags: record.take_many("tags")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub id: Option<i64>,
    pub street: String,
    pub city: String,
}

impl Address {
    pub fn new(street: &str, city: &str) -> Self {
        Self {
            id: None,
            street: street.to_string(),
            city: city.to_string(),
        }
    }
}

impl Entity for Address {
    fn definition() -> EntityDef {
        EntityDef::new("address")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("street", FieldType::String))
            .column(ColumnDef::new("city", FieldType::String))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("street", self.street.as_str())
            .with("city", self.city.as_str())
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            street: record.get("street")?,
            city: record.get("city")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phone {
    pub id: Option<i64>,
    pub number: String,
}

impl Phone {
    pub fn new(number: &str) -> Self {
        Self {
            id: None,
            number: number.to_string(),
        }
    }
}

impl Entity for Phone {
    fn definition() -> EntityDef {
        EntityDef::new("phone")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("number", FieldType::String))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("number", self.number.as_str())
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            number: record.get("number")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: Option<i64>,
    pub label: String,
}

impl Tag {
    pub fn new(label: &str) -> Self {
        Self {
            id: None,
            label: label.to_string(),
        }
    }
}

impl Entity for Tag {
    fn definition() -> EntityDef {
        EntityDef::new("tag")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("label", FieldType::String))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("label", self.label.as_str())
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            label: record.get("label")?,
        })
    }
}

/// Department and Employee reference each other.
#[derive(Debug, Clone, PartialEq)]
pub struct Department {
    pub id: Option<i64>,
    pub title: String,
    pub staff: Vec<Employee>,
}

impl Entity for Department {
    fn definition() -> EntityDef {
        EntityDef::new("department")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("title", FieldType::String))
            .association(AssociationDef::to_many::<Employee>("staff").join_column("department_id"))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("title", self.title.as_str())
            .with_many("staff", self.staff.iter().map(Entity::to_record).collect())
    }

    fn from_record(mut record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            title: record.get("title")?,
            staff: record.take_many("staff")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Employee {
    pub id: Option<i64>,
    pub full_name: String,
    pub department: Option<Box<Department>>,
}

impl Entity for Employee {
    fn definition() -> EntityDef {
        EntityDef::new("employee")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("full_name", FieldType::String))
            .association(AssociationDef::to_one::<Department>("department").join_column("department_id"))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("full_name", self.full_name.as_str())
            .with_one("department", self.department.as_ref().map(|d| d.to_record()))
    }

    fn from_record(mut record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            full_name: record.get("full_name")?,
            department: record.take_one::<Department>("department")?.map(Box::new),
        })
    }
}

/// Books come back ordered by id; labels are linked, never saved, through the shelf.
#[derive(Debug, Clone, PartialEq)]
pub struct Shelf {
    pub id: Option<i64>,
    pub title: String,
    pub books: Vec<Book>,
    pub labels: Vec<Tag>,
}

impl Shelf {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            books: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn book_ids(&self) -> Vec<i64> {
        self.books.iter().filter_map(|b| b.id).collect()
    }
}

impl Entity for Shelf {
    fn definition() -> EntityDef {
        EntityDef::new("shelf")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("title", FieldType::String))
            .association(
                AssociationDef::to_many::<Book>("books")
                    .join_column("shelf_id")
                    .container(Container::SortedSet)
                    .cascade([Cascade::All]),
            )
            .association(
                AssociationDef::many_to_many::<Tag>("labels")
                    .join_table(
                        JoinTable::new("shelf_tag")
                            .join_column(JoinColumn::new("shelf_id"))
                            .inverse_join_column(JoinColumn::new("tag_id")),
                    )
                    .container(Container::Set),
            )
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("title", self.title.as_str())
            .with_many("books", self.books.iter().map(Entity::to_record).collect())
            .with_many("labels", self.labels.iter().map(Entity::to_record).collect())
    }

    fn from_record(mut record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            title: record.get("title")?,
            books: record.take_many("books")?,
            labels: record.take_many("labels")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub id: Option<i64>,
    pub title: String,
}

impl Book {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
        }
    }
}

impl Entity for Book {
    fn definition() -> EntityDef {
        EntityDef::new("book")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("title", FieldType::String))
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("title", self.title.as_str())
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            title: record.get("title")?,
        })
    }
}

// =============================================================================
// Schema
// =============================================================================

const SCHEMA: &[&str] = &[
    "CREATE TABLE address (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        street TEXT NOT NULL,
        city TEXT NOT NULL
    )",
    "CREATE TABLE person (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        active TEXT NOT NULL,
        updated_at TEXT,
        address_id INTEGER REFERENCES address(id)
    )",
    "CREATE TABLE phone (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        number TEXT NOT NULL,
        person_id INTEGER NOT NULL REFERENCES person(id)
    )",
    "CREATE TABLE tag (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE person_tag (
        person_id INTEGER NOT NULL REFERENCES person(id),
        tag_id INTEGER NOT NULL REFERENCES tag(id),
        PRIMARY KEY (person_id, tag_id)
    )",
    "CREATE TABLE department (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL
    )",
    "CREATE TABLE employee (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        full_name TEXT NOT NULL,
        department_id INTEGER REFERENCES department(id)
    )",
    "CREATE TABLE shelf (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL
    )",
    "CREATE TABLE book (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        shelf_id INTEGER NOT NULL REFERENCES shelf(id)
    )",
    "CREATE TABLE shelf_tag (
        shelf_id INTEGER NOT NULL REFERENCES shelf(id),
        tag_id INTEGER NOT NULL REFERENCES tag(id),
        PRIMARY KEY (shelf_id, tag_id)
    )",
];

pub async fn create_schema(session: &mut dyn SqlSession) {
    for statement in SCHEMA {
        session.execute(statement, &[]).await.unwrap();
    }
}

pub async fn memory_session() -> SqliteSession {
    init_tracing();
    let mut session = SqliteSession::memory().await.unwrap();
    create_schema(&mut session).await;
    session
}

pub async fn file_session(path: &Path) -> SqliteSession {
    init_tracing();
    SqliteSession::open(path).await.unwrap()
}

pub async fn count(session: &mut dyn SqlSession, table: &str) -> i64 {
    let rows = session
        .fetch_all(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .await
        .unwrap();
    match rows[0].get(0) {
        Some(SqlValue::BigInt(n)) => *n,
        other => panic!("unexpected count {:?}", other),
    }
}

// =============================================================================
// Session wrappers
// =============================================================================

/// Records every statement and optionally fails the first one starting
/// with a given prefix.
pub struct RecordingSession<S: SqlSession> {
    pub inner: S,
    pub statements: Vec<String>,
    pub fail_on: Option<String>,
    /// `(prefix, sql)`: runs `sql` once, right before the first statement
    /// starting with `prefix`.
    pub interject: Option<(String, String)>,
}

impl<S: SqlSession> RecordingSession<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            statements: Vec::new(),
            fail_on: None,
            interject: None,
        }
    }

    pub fn failing_on(inner: S, prefix: &str) -> Self {
        Self {
            fail_on: Some(prefix.to_string()),
            ..Self::new(inner)
        }
    }

    /// Runs `sql` on the wrapped session just before the next statement
    /// starting with `prefix`.
    pub fn interjecting(mut self, prefix: &str, sql: &str) -> Self {
        self.interject = Some((prefix.to_string(), sql.to_string()));
        self
    }

    async fn run_interjection(&mut self, sql: &str) -> Result<()> {
        let due = matches!(&self.interject, Some((prefix, _)) if sql.starts_with(prefix.as_str()));
        if due {
            if let Some((_, side)) = self.interject.take() {
                self.inner.execute(&side, &[]).await?;
            }
        }
        Ok(())
    }

    /// Number of recorded statements starting with `prefix`.
    pub fn count_starting_with(&self, prefix: &str) -> usize {
        self.statements.iter().filter(|s| s.starts_with(prefix)).count()
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }

    fn record(&mut self, sql: &str) -> Result<()> {
        self.statements.push(sql.to_string());
        match &self.fail_on {
            Some(prefix) if sql.starts_with(prefix.as_str()) => Err(TableGraphError::Database(
                format!("injected failure on: {}", sql),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<S: SqlSession> SqlSession for RecordingSession<S> {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.record(sql)?;
        self.run_interjection(sql).await?;
        self.inner.execute(sql, params).await
    }

    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.record(sql)?;
        self.run_interjection(sql).await?;
        self.inner.fetch_all(sql, params).await
    }

    async fn insert_returning(
        &mut self,
        sql: &str,
        key_columns: &[&str],
        params: &[SqlValue],
    ) -> Result<SqlValue> {
        self.record(sql)?;
        self.run_interjection(sql).await?;
        self.inner.insert_returning(sql, key_columns, params).await
    }

    fn auto_commit(&self) -> bool {
        self.inner.auto_commit()
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.inner.set_auto_commit(auto_commit).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.inner.rollback().await
    }
}
