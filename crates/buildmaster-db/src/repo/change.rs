//! Change repository.

use async_trait::async_trait;
use buildmaster_core::{Change, ChangeId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait ChangeRepo: Send + Sync {
    /// Store a change, assigning it a fresh id. The id on `change` is ignored.
    async fn add_change(&self, change: Change) -> DbResult<Change>;
    async fn get_change(&self, id: ChangeId) -> DbResult<Change>;
}

/// A change row in the database.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChangeRecord {
    pub id: i64,
    pub author: String,
    pub comments: String,
    pub branch: Option<String>,
    pub category: Option<String>,
    pub revision: Option<String>,
    pub repository: String,
    pub project: String,
    pub codebase: String,
    pub files: Vec<String>,
    pub when_ts: DateTime<Utc>,
}

impl From<ChangeRecord> for Change {
    fn from(row: ChangeRecord) -> Self {
        Change {
            id: ChangeId(row.id),
            author: row.author,
            comments: row.comments,
            branch: row.branch,
            category: row.category,
            revision: row.revision,
            repository: row.repository,
            project: row.project,
            codebase: row.codebase,
            files: row.files,
            when: row.when_ts,
        }
    }
}

/// PostgreSQL implementation of ChangeRepo.
pub struct PgChangeRepo {
    pool: PgPool,
}

impl PgChangeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeRepo for PgChangeRepo {
    async fn add_change(&self, change: Change) -> DbResult<Change> {
        let row = sqlx::query_as::<_, ChangeRecord>(
            r#"
            INSERT INTO changes (author, comments, branch, category, revision,
                                 repository, project, codebase, files, when_ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(&change.author)
        .bind(&change.comments)
        .bind(&change.branch)
        .bind(&change.category)
        .bind(&change.revision)
        .bind(&change.repository)
        .bind(&change.project)
        .bind(&change.codebase)
        .bind(&change.files)
        .bind(change.when)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_change(&self, id: ChangeId) -> DbResult<Change> {
        let row = sqlx::query_as::<_, ChangeRecord>("SELECT * FROM changes WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("change {}", id)))?;
        Ok(row.into())
    }
}
