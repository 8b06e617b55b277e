//! Common utilities for tablegraph
//!
//! This crate provides the error taxonomy shared by the mapping engine and
//! its SQL backends.

pub mod error;

pub use error::{Result, TableGraphError};
