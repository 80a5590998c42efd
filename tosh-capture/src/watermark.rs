use std::cmp::Ordering;
use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Position in a source's change stream.
///
/// Row-id sources use `Integer`; sources ordered by a modification
/// timestamp (e.g. Core Data `ZMODIFICATIONDATE`) use `Real`. Values compare
/// numerically across variants, matching SQLite's own comparison rules, so a
/// watermark can be stored in an untyped column and compared in SQL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Watermark {
    Integer(i64),
    Real(f64),
}

impl Watermark {
    /// Where detection starts for a source that was never delivered.
    pub const START: Watermark = Watermark::Integer(0);

    pub fn max(self, other: Watermark) -> Watermark {
        if other > self {
            other
        } else {
            self
        }
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Watermark::START
    }
}

impl PartialEq for Watermark {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (*self, *other) {
            (Watermark::Integer(a), Watermark::Integer(b)) => Some(a.cmp(&b)),
            (Watermark::Integer(a), Watermark::Real(b)) => (a as f64).partial_cmp(&b),
            (Watermark::Real(a), Watermark::Integer(b)) => a.partial_cmp(&(b as f64)),
            (Watermark::Real(a), Watermark::Real(b)) => a.partial_cmp(&b),
        }
    }
}

impl From<i64> for Watermark {
    fn from(value: i64) -> Self {
        Watermark::Integer(value)
    }
}

impl From<f64> for Watermark {
    fn from(value: f64) -> Self {
        Watermark::Real(value)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Integer(value) => write!(f, "{value}"),
            Watermark::Real(value) => write!(f, "{value}"),
        }
    }
}

impl ToSql for Watermark {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match *self {
            Watermark::Integer(value) => ToSqlOutput::from(value),
            Watermark::Real(value) => ToSqlOutput::from(value),
        })
    }
}

impl FromSql for Watermark {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(value) => Ok(Watermark::Integer(value)),
            ValueRef::Real(value) if value.is_finite() => Ok(Watermark::Real(value)),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}
