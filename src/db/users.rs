use super::{DbError, Gateway, Transaction};
use crate::params;

use time::OffsetDateTime;

/// A query helper type for operating on [User]s. Usually you rent this from
/// a [Gateway].
#[derive(Debug)]
pub struct Users<'a> {
    db: &'a Gateway,
}

/// Record struct for people who've logged in through one of the OAuth
/// providers. One row per (provider, provider_id).
#[derive(Debug, PartialEq, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub provider: String,
    pub provider_id: String,
    pub login: String,
    pub name: String,
    pub avatar_url: String,
    pub created: OffsetDateTime,
    pub last_login: OffsetDateTime,
}

/// Whatever a provider told us about who just logged in.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderIdentity<'a> {
    pub provider: &'a str,
    pub provider_id: &'a str,
    pub login: &'a str,
    pub name: &'a str,
    pub avatar_url: &'a str,
}

const USER_COLUMNS: &str = "id, provider, provider_id, login, name, avatar_url, created, last_login";

// upsert, find, count
impl<'a> Users<'a> {
    pub fn new(db: &'a Gateway) -> Self {
        Self { db }
    }

    /// Record a login: create the user the first time we see them, otherwise
    /// refresh their profile fields and last_login. Runs as one transaction.
    #[tracing::instrument(skip_all, fields(provider = ident.provider))]
    pub async fn upsert(&self, ident: &ProviderIdentity<'_>) -> Result<User, DbError> {
        let mut tx = self.db.begin_transaction().await?;
        match Self::upsert_in(&mut tx, ident).await {
            Ok(user) => {
                tx.commit().await?;
                Ok(user)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn upsert_in(tx: &mut Transaction, ident: &ProviderIdentity<'_>) -> Result<User, DbError> {
        let existing = tx
            .query_row(
                "SELECT id FROM users WHERE provider = ?1 AND provider_id = ?2;",
                params![ident.provider, ident.provider_id],
            )
            .scan_one::<i64>()
            .await;
        let id = match existing {
            Ok(id) => {
                tx.exec(
                    r#"
                        UPDATE users
                        SET login = ?1, name = ?2, avatar_url = ?3, last_login = CURRENT_TIMESTAMP
                        WHERE id = ?4;
                    "#,
                    params![ident.login, ident.name, ident.avatar_url, id],
                )
                .await?;
                id
            }
            Err(e) if e.is_no_rows() => {
                tx.exec(
                    r#"
                        INSERT INTO users (provider, provider_id, login, name, avatar_url)
                        VALUES (?1, ?2, ?3, ?4, ?5);
                    "#,
                    params![
                        ident.provider,
                        ident.provider_id,
                        ident.login,
                        ident.name,
                        ident.avatar_url
                    ],
                )
                .await?;
                tx.query_row("SELECT last_insert_rowid();", params![])
                    .scan_one::<i64>()
                    .await?
            }
            Err(e) => return Err(e),
        };
        tx.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1;", USER_COLUMNS),
            params![id],
        )
        .scan::<User>()
        .await
    }

    /// Look a user up by provider identity. Ok(None) on a well-behaved not-found.
    #[tracing::instrument(skip(self))]
    pub async fn find(&self, provider: &str, provider_id: &str) -> Result<Option<User>, DbError> {
        let res = self
            .db
            .query_row(
                &format!(
                    "SELECT {} FROM users WHERE provider = ?1 AND provider_id = ?2;",
                    USER_COLUMNS
                ),
                params![provider, provider_id],
            )
            .scan::<User>()
            .await;
        match res {
            Ok(user) => Ok(Some(user)),
            Err(e) if e.is_no_rows() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// How many distinct people have ever logged in.
    #[tracing::instrument(skip(self))]
    pub async fn count(&self) -> Result<i64, DbError> {
        let mut rows = self.db.query("SELECT COUNT(*) FROM users;", params![]).await?;
        Ok(rows.scan_next::<(i64,)>()?.map_or(0, |(n,)| n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn octocat() -> ProviderIdentity<'static> {
        ProviderIdentity {
            provider: "github",
            provider_id: "583231",
            login: "octocat",
            name: "The Octocat",
            avatar_url: "https://avatars.githubusercontent.com/u/583231",
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let (_dir, db) = Gateway::new_test_db().await;
        let users = db.users();

        assert!(users.find("github", "583231").await.unwrap().is_none());
        assert_eq!(users.count().await.unwrap(), 0);

        let first = users.upsert(&octocat()).await.unwrap();
        assert_eq!(first.login, "octocat");
        assert_eq!(users.count().await.unwrap(), 1);

        let renamed = ProviderIdentity {
            login: "octocat2",
            ..octocat()
        };
        let second = users.upsert(&renamed).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.login, "octocat2");
        assert_eq!(second.created, first.created);
        assert_eq!(users.count().await.unwrap(), 1);

        let found = users.find("github", "583231").await.unwrap().unwrap();
        assert_eq!(found, second);

        // same id on a different provider is a different person.
        let other = ProviderIdentity {
            provider: "x",
            ..octocat()
        };
        let third = users.upsert(&other).await.unwrap();
        assert_ne!(third.id, first.id);
        assert_eq!(users.count().await.unwrap(), 2);

        db.close().await;
    }
}
