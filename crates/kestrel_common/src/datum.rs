//! Row values as seen by the index engine.

use serde::{Deserialize, Serialize};

/// A single column value. The index engine only ever materialises the
/// columns an index covers, so the set of variants is intentionally small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int64(i64),
    Float64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Str(v.to_string())
    }
}
