//! Storage. Everything goes through a [`Gateway`]: one writer connection for
//! mutations and transactions, a pool of read-only connections for the rest,
//! both on the same sqlite file in WAL mode. Every statement runs under its
//! own timeout; callers hand over raw SQL and a [`params!`](crate::params)
//! list and get rows or an error back.
//!
//! Record helpers like [`Users`] just borrow a gateway, so it reads like
//! `db.users().upsert(...)`.
mod db_tests;
mod error;
mod gateway;
mod row;
mod transaction;
mod users;
mod value;

pub use error::DbError;
pub use gateway::{is_in_memory, DbOptions, Gateway};
pub use transaction::Transaction;
pub use users::{ProviderIdentity, User, Users};
pub use value::Value;

/// The app's tables. No migrations engine; this is idempotent DDL, run as
/// one batch.
pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

pub async fn apply_schema(db: &Gateway) -> Result<(), DbError> {
    db.exec(SCHEMA, crate::params![]).await?;
    Ok(())
}

impl Gateway {
    pub fn users(&self) -> Users {
        Users::new(self)
    }
}
