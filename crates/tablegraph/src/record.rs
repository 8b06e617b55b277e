//! Reflection-free carrier between domain types and the engine.

use crate::entity::Entity;
use crate::value::{FromValue, SqlValue};
use crate::{Result, TableGraphError};

/// Value of a relationship field.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

/// Field values and relations of one entity instance, keyed by field name.
///
/// A missing value reads as NULL; a missing relation reads as empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(String, SqlValue)>,
    relations: Vec<(String, Related)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<SqlValue>) {
        let field = field.into();
        let value = value.into();
        match self.values.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.values.push((field, value)),
        }
    }

    pub fn get_value(&self, field: &str) -> Option<&SqlValue> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Extracts a field as `T`, treating a missing field as NULL.
    pub fn get<T: FromValue>(&self, field: &str) -> Result<T> {
        let value = self.get_value(field).cloned().unwrap_or(SqlValue::Null);
        T::from_value(value).map_err(|e| match e {
            TableGraphError::Conversion(msg) => {
                TableGraphError::Conversion(format!("field '{}': {}", field, msg))
            }
            other => other,
        })
    }

    pub fn with_one(mut self, field: impl Into<String>, child: Option<Record>) -> Self {
        self.set_one(field, child);
        self
    }

    pub fn with_many(mut self, field: impl Into<String>, children: Vec<Record>) -> Self {
        self.set_many(field, children);
        self
    }

    pub fn set_one(&mut self, field: impl Into<String>, child: Option<Record>) {
        self.set_related(field.into(), Related::One(child.map(Box::new)));
    }

    pub fn set_many(&mut self, field: impl Into<String>, children: Vec<Record>) {
        self.set_related(field.into(), Related::Many(children));
    }

    fn set_related(&mut self, field: String, related: Related) {
        match self.relations.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = related,
            None => self.relations.push((field, related)),
        }
    }

    pub fn related(&self, field: &str) -> Option<&Related> {
        self.relations
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, related)| related)
    }

    /// The single child held by `field`, if any.
    pub fn one(&self, field: &str) -> Option<&Record> {
        match self.related(field) {
            Some(Related::One(child)) => child.as_deref(),
            Some(Related::Many(children)) => children.first(),
            None => None,
        }
    }

    /// The children held by `field`; empty when unset.
    pub fn many(&self, field: &str) -> &[Record] {
        match self.related(field) {
            Some(Related::Many(children)) => children,
            Some(Related::One(Some(child))) => std::slice::from_ref(child.as_ref()),
            _ => &[],
        }
    }

    fn take_related(&mut self, field: &str) -> Option<Related> {
        let index = self.relations.iter().position(|(name, _)| name == field)?;
        Some(self.relations.remove(index).1)
    }

    /// Moves the single child out of `field` and converts it.
    pub fn take_one<T: Entity>(&mut self, field: &str) -> Result<Option<T>> {
        let child = match self.take_related(field) {
            Some(Related::One(child)) => child.map(|c| *c),
            Some(Related::Many(mut children)) => {
                if children.is_empty() {
                    None
                } else {
                    Some(children.swap_remove(0))
                }
            }
            None => None,
        };
        child.map(T::from_record).transpose()
    }

    /// Moves the children out of `field` and converts them into `C`.
    pub fn take_many<T: Entity, C: FromIterator<T>>(&mut self, field: &str) -> Result<C> {
        let children = match self.take_related(field) {
            Some(Related::Many(children)) => children,
            Some(Related::One(Some(child))) => vec![*child],
            _ => Vec::new(),
        };
        children.into_iter().map(T::from_record).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn relations(&self) -> impl Iterator<Item = (&str, &Related)> {
        self.relations.iter().map(|(name, related)| (name.as_str(), related))
    }
}
