use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};

/// A bound statement parameter. Callers hand the gateway raw SQL plus a
/// slice of these; the [`params!`](crate::params) macro builds the slice
/// from ordinary Rust values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<usize> for Value {
    // sqlite integers are i64, so anything bigger saturates.
    fn from(v: usize) -> Self {
        Self::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Blob(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a `&[Value]` parameter list, rusqlite-style:
/// `params!["alice", 42, None::<&str>]`.
#[macro_export]
macro_rules! params {
    () => {
        &[] as &[$crate::db::Value]
    };
    ($($param:expr),+ $(,)?) => {
        &[$($crate::db::Value::from($param)),+] as &[$crate::db::Value]
    };
}

pub(crate) fn bind_all<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(query, |q, param| match param {
        Value::Null => q.bind(None::<i64>),
        Value::Integer(v) => q.bind(*v),
        Value::Real(v) => q.bind(*v),
        Value::Text(v) => q.bind(v.as_str()),
        Value::Blob(v) => q.bind(v.as_slice()),
    })
}
