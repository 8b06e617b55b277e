//! Criterion benchmark suite for tablegraph
//!
//! Benchmarks the hot paths of the engine:
//! - Join plan synthesis for a root with to-one, to-many and many-to-many fields
//! - Graph reconstruction from 10k join rows
//! - Cascading save and load of one graph against in-memory SQLite
//!
//! Usage:
//!   cargo bench -p tablegraph

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tablegraph::reconstruct::GraphBuilder;
use tablegraph::{
    AssociationDef, Cascade, ColumnDef, Entity, EntityDef, FieldType, JoinColumn, JoinPlan,
    JoinTable, Record, Registry, Repository, Result, SqlSession, SqlValue, SqliteSession,
};

#[derive(Debug, Clone)]
struct Customer {
    id: Option<i64>,
    name: String,
    region: Option<Region>,
    orders: Vec<Order>,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
struct Region {
    id: Option<i64>,
    code: String,
}

#[derive(Debug, Clone)]
struct Order {
    id: Option<i64>,
    total: i64,
}

#[derive(Debug, Clone)]
struct Segment {
    id: Option<i64>,
    label: String,
}

impl Entity for Customer {
    fn definition() -> EntityDef {
        EntityDef::new("customer")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("name", FieldType::String))
            .association(
                AssociationDef::to_one::<Region>("region")
                    .join_column("region_id")
                    .cascade([Cascade::All]),
            )
            .association(
                AssociationDef::to_many::<Order>("orders")
                    .join_column("customer_id")
                    .cascade([Cascade::All]),
            )
            .association(
                AssociationDef::many_to_many::<Segment>("segments")
                    .join_table(
                        JoinTable::new("customer_segment")
                            .join_column(JoinColumn::new("customer_id"))
                            .inverse_join_column(JoinColumn::new("segment_id")),
                    )
                    .cascade([Cascade::Persist, Cascade::Merge]),
            )
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
            .with_one("region", self.region.as_ref().map(Entity::to_record))
            .with_many("orders", self.orders.iter().map(Entity::to_record).collect())
            .with_many("segments", self.segments.iter().map(Entity::to_record).collect())
    }

    fn from_record(mut record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            name: record.get("name")?,
            region: record.take_one("region")?,
            orders: record.take_many("orders")?,
            segments: record.take_many("segments")?,
        })
    }
}

impl Entity for Region {
    fn definition() -> EntityDef {
        EntityDef::new("region")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("code", FieldType::String))
    }

    fn to_record(&self) -> Record {
        Record::new().with("id", self.id).with("code", self.code.as_str())
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            code: record.get("code")?,
        })
    }
}

impl Entity for Order {
    fn definition() -> EntityDef {
        EntityDef::new("purchase")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("total", FieldType::BigInt))
    }

    fn to_record(&self) -> Record {
        Record::new().with("id", self.id).with("total", self.total)
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            total: record.get("total")?,
        })
    }
}

impl Entity for Segment {
    fn definition() -> EntityDef {
        EntityDef::new("segment")
            .id(ColumnDef::new("id", FieldType::BigInt))
            .column(ColumnDef::new("label", FieldType::String))
    }

    fn to_record(&self) -> Record {
        Record::new().with("id", self.id).with("label", self.label.as_str())
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            id: record.get("id")?,
            label: record.get("label")?,
        })
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE region (id INTEGER PRIMARY KEY AUTOINCREMENT, code TEXT NOT NULL)",
    "CREATE TABLE customer (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, region_id INTEGER REFERENCES region(id))",
    "CREATE TABLE purchase (id INTEGER PRIMARY KEY AUTOINCREMENT, total INTEGER NOT NULL, customer_id INTEGER NOT NULL REFERENCES customer(id))",
    "CREATE TABLE segment (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT NOT NULL)",
    "CREATE TABLE customer_segment (customer_id INTEGER NOT NULL, segment_id INTEGER NOT NULL, PRIMARY KEY (customer_id, segment_id))",
];

fn sample_customer(orders: i64) -> Customer {
    Customer {
        id: None,
        name: "Bench Customer".to_string(),
        region: Some(Region {
            id: None,
            code: "EU".to_string(),
        }),
        orders: (1..=orders).map(|total| Order { id: None, total }).collect(),
        segments: Vec::new(),
    }
}

/// Synthetic join rows: 100 customers x 20 orders x 5 segments.
fn synthetic_rows() -> Vec<Vec<SqlValue>> {
    let mut rows = Vec::with_capacity(10_000);
    for customer in 0..100i64 {
        for order in 0..20i64 {
            for segment in 0..5i64 {
                rows.push(vec![
                    SqlValue::BigInt(customer),
                    SqlValue::String(format!("Customer {}", customer)),
                    SqlValue::BigInt(customer % 7),
                    SqlValue::String("EU".to_string()),
                    SqlValue::BigInt(customer * 100 + order),
                    SqlValue::BigInt(order * 10),
                    SqlValue::BigInt(segment),
                    SqlValue::String(format!("segment-{}", segment)),
                ]);
            }
        }
    }
    rows
}

/// Benchmark: Join plan synthesis on a fresh registry
fn bench_plan_synthesis(c: &mut Criterion) {
    c.bench_function("join_plan_synthesis", |b: &mut criterion::Bencher| {
        b.iter(|| {
            let registry = Registry::new();
            registry.register::<Customer>().unwrap();
            black_box(JoinPlan::build(&registry, "customer").unwrap())
        });
    });
}

/// Benchmark: Graph reconstruction from 10k rows
fn bench_reconstruction(c: &mut Criterion) {
    let registry = Registry::new();
    let plan = registry.join_plan::<Customer>().unwrap();
    let rows = synthetic_rows();

    c.bench_function("reconstruct_10k_rows", |b: &mut criterion::Bencher| {
        b.iter(|| {
            let mut builder = GraphBuilder::new(&plan);
            for row in &rows {
                builder.push_row(row).unwrap();
            }
            let records = black_box(builder.finish());
            assert_eq!(records.len(), 100);
        });
    });
}

/// Benchmark: Cascading save then reload of a 50-order graph
fn bench_save_graph(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let repo: Repository<Customer, i64> = Repository::new(Arc::new(Registry::new())).unwrap();
    let mut session = runtime.block_on(async {
        let mut session = SqliteSession::memory().await.unwrap();
        for statement in SCHEMA {
            session.execute(statement, &[]).await.unwrap();
        }
        session
    });
    let customer = sample_customer(50);

    c.bench_function("save_graph_50_children", |b: &mut criterion::Bencher| {
        b.iter(|| {
            runtime.block_on(async {
                let saved = repo.save(&mut session, &customer).await.unwrap();
                black_box(repo.find_by_id(&mut session, saved.id.unwrap()).await.unwrap());
            })
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(20)
        .measurement_time(Duration::from_secs(10));
    targets = bench_plan_synthesis, bench_reconstruction, bench_save_graph
}

criterion_main!(benches);
