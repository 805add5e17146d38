//! Shared model types for KestrelDB.
//!
//! Everything other crates agree on lives here: identifiers, the datum
//! value type, schema descriptors (tables, columns, indexes and their
//! lifecycle states), the DDL job record, and the error taxonomy.

pub mod datum;
pub mod error;
pub mod job;
pub mod schema;
pub mod types;
