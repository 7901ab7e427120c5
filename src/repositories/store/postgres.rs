use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use super::{Apply, ApplyFn, DocumentStore, Outcome, StoreError};

#[derive(Clone)]
pub struct PgStore {
    conn: PgPool,
    max_retries: usize,
}

impl PgStore {
    pub fn new(conn: PgPool, max_retries: usize) -> Self {
        Self {
            conn,
            max_retries: max_retries.max(1),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query("CREATE SEQUENCE IF NOT EXISTS document_versions")
            .execute(&self.conn)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                version BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    async fn read_versioned(
        &self,
        paths: &[String],
    ) -> Result<(Vec<Option<Value>>, Vec<Option<i64>>), StoreError> {
        let rows: Vec<(String, Value, i64)> =
            sqlx::query_as("SELECT path, value, version FROM documents WHERE path = ANY($1)")
                .bind(paths.to_vec())
                .fetch_all(&self.conn)
                .await?;

        Ok(paths
            .iter()
            .map(|p| match rows.iter().find(|(path, _, _)| path == p) {
                Some((_, value, version)) => (Some(value.clone()), Some(*version)),
                None => (None, None),
            })
            .unzip())
    }

    /// Applies the writes only if every path still has the version it was
    /// read with. Returns false when a concurrent writer got there first.
    async fn try_commit(
        &self,
        paths: &[String],
        versions: &[Option<i64>],
        values: &[Option<Value>],
    ) -> Result<bool, StoreError> {
        let mut tx = self.conn.begin().await?;

        for ((path, expected), value) in paths.iter().zip(versions).zip(values) {
            let affected = match (expected, value) {
                (None, Some(value)) => sqlx::query(
                    r#"
                    INSERT INTO documents (path, value, version)
                    VALUES ($1, $2, nextval('document_versions'))
                    ON CONFLICT (path) DO NOTHING
                    "#,
                )
                .bind(path)
                .bind(value)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                (Some(version), Some(value)) => sqlx::query(
                    r#"
                    UPDATE documents
                    SET value = $2, version = nextval('document_versions'), updated_at = CURRENT_TIMESTAMP
                    WHERE path = $1 AND version = $3
                    "#,
                )
                .bind(path)
                .bind(value)
                .bind(version)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                (Some(version), None) => {
                    sqlx::query("DELETE FROM documents WHERE path = $1 AND version = $2")
                        .bind(path)
                        .bind(version)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected()
                }
                (None, None) => {
                    let exists: bool =
                        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM documents WHERE path = $1)")
                            .bind(path)
                            .fetch_one(&mut *tx)
                            .await?;
                    if exists {
                        0
                    } else {
                        1
                    }
                }
            };

            if affected != 1 {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let value: Option<Value> = sqlx::query_scalar("SELECT value FROM documents WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.conn)
            .await?;

        Ok(value)
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let prefix = format!("{path}/");
        let rows: Vec<(String, Value)> = sqlx::query_as(
            "SELECT path, value FROM documents WHERE left(path, $2) = $1 ORDER BY path",
        )
        .bind(&prefix)
        .bind(prefix.chars().count() as i32)
        .fetch_all(&self.conn)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(p, value)| {
                let key = p[prefix.len()..].to_string();
                (!key.contains('/')).then_some((key, value))
            })
            .collect())
    }

    async fn update(&self, writes: Vec<(String, Option<Value>)>) -> Result<(), StoreError> {
        let mut tx = self.conn.begin().await?;

        for (path, value) in writes {
            match value {
                Some(value) => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (path, value, version)
                        VALUES ($1, $2, nextval('document_versions'))
                        ON CONFLICT (path) DO UPDATE
                        SET value = EXCLUDED.value, version = EXCLUDED.version, updated_at = CURRENT_TIMESTAMP
                        "#,
                    )
                    .bind(&path)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM documents WHERE path = $1")
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn compare_and_apply_many(
        &self,
        paths: &[String],
        apply: &ApplyFn<'_>,
    ) -> Result<Outcome, StoreError> {
        for attempt in 1..=self.max_retries {
            let (values, versions) = self.read_versioned(paths).await?;

            let new_values = match apply(&values)? {
                Apply::Abort => return Ok(Outcome::Aborted(values)),
                Apply::Commit(new_values) => new_values,
            };
            if new_values.len() != paths.len() {
                return Err(StoreError::Arity {
                    expected: paths.len(),
                    returned: new_values.len(),
                });
            }

            if self.try_commit(paths, &versions, &new_values).await? {
                return Ok(Outcome::Committed(new_values));
            }

            log::debug!("Conflict on {:?}, attempt {}.", paths, attempt);
        }

        Err(StoreError::Contention {
            paths: paths.to_vec(),
            attempts: self.max_retries,
        })
    }
}
