//! Build request repository.

use async_trait::async_trait;
use buildmaster_core::{
    BuildRequest, BuildRequestId, BuildResult, BuildsetId, MasterId, SourceStamp,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::BTreeMap;

use crate::{DbError, DbResult};

/// Everything needed to create a buildset and its build requests.
#[derive(Debug, Clone)]
pub struct NewBuildset {
    pub builder_names: Vec<String>,
    pub sourcestamps: Vec<SourceStamp>,
    pub reason: String,
    pub priority: i32,
}

#[async_trait]
pub trait BuildRequestRepo: Send + Sync {
    /// Create a buildset with one build request per builder.
    async fn create_build_requests(
        &self,
        buildset: NewBuildset,
    ) -> DbResult<(BuildsetId, BTreeMap<String, BuildRequestId>)>;

    /// Claim every request in `ids` for `master`. Returns `false`, claiming
    /// nothing, if any of them is already claimed or complete.
    async fn claim_build_requests(&self, ids: &[BuildRequestId], master: MasterId)
    -> DbResult<bool>;

    /// Give up claims held by `master`, making the requests pending again.
    async fn unclaim_build_requests(&self, ids: &[BuildRequestId], master: MasterId)
    -> DbResult<()>;

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        result: BuildResult,
    ) -> DbResult<()>;

    async fn get_unclaimed_build_requests(&self, builder_name: &str)
    -> DbResult<Vec<BuildRequest>>;

    async fn get_build_request(&self, id: BuildRequestId) -> DbResult<BuildRequest>;
}

/// A build request row joined with its buildset.
#[derive(Debug, sqlx::FromRow)]
struct BuildRequestRecord {
    id: i64,
    buildset_id: i64,
    builder_name: String,
    priority: i32,
    submitted_at: DateTime<Utc>,
    claimed_by_master: Option<i64>,
    claimed_at: Option<DateTime<Utc>>,
    complete: bool,
    results: Option<i32>,
    reason: String,
    sourcestamps: Json<Vec<SourceStamp>>,
}

impl From<BuildRequestRecord> for BuildRequest {
    fn from(row: BuildRequestRecord) -> Self {
        BuildRequest {
            id: BuildRequestId(row.id),
            buildset_id: BuildsetId(row.buildset_id),
            builder_name: row.builder_name,
            priority: row.priority,
            submitted_at: row.submitted_at,
            claimed_by: row.claimed_by_master.map(MasterId),
            claimed_at: row.claimed_at,
            complete: row.complete,
            results: row.results.and_then(BuildResult::from_code),
            reason: row.reason,
            sourcestamps: row.sourcestamps.0,
        }
    }
}

const SELECT_BUILD_REQUEST: &str = r#"
    SELECT br.id, br.buildset_id, br.builder_name, br.priority, br.submitted_at,
           br.claimed_by_master, br.claimed_at, br.complete, br.results,
           bs.reason, bs.sourcestamps
    FROM buildrequests br
    JOIN buildsets bs ON bs.id = br.buildset_id
"#;

fn raw_ids(ids: &[BuildRequestId]) -> Vec<i64> {
    ids.iter().map(|id| id.get()).collect()
}

/// PostgreSQL implementation of BuildRequestRepo.
pub struct PgBuildRequestRepo {
    pool: PgPool,
}

impl PgBuildRequestRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildRequestRepo for PgBuildRequestRepo {
    async fn create_build_requests(
        &self,
        buildset: NewBuildset,
    ) -> DbResult<(BuildsetId, BTreeMap<String, BuildRequestId>)> {
        let mut tx = self.pool.begin().await?;

        let buildset_id: i64 = sqlx::query_scalar(
            "INSERT INTO buildsets (reason, sourcestamps) VALUES ($1, $2) RETURNING id",
        )
        .bind(&buildset.reason)
        .bind(Json(&buildset.sourcestamps))
        .fetch_one(&mut *tx)
        .await?;

        let mut requests = BTreeMap::new();
        for builder_name in &buildset.builder_names {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO buildrequests (buildset_id, builder_name, priority)
                VALUES ($1, $2, $3)
                RETURNING id
                "#,
            )
            .bind(buildset_id)
            .bind(builder_name)
            .bind(buildset.priority)
            .fetch_one(&mut *tx)
            .await?;
            requests.insert(builder_name.clone(), BuildRequestId(id));
        }

        tx.commit().await?;
        Ok((BuildsetId(buildset_id), requests))
    }

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        master: MasterId,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE buildrequests
            SET claimed_by_master = $1, claimed_at = NOW()
            WHERE id = ANY($2) AND claimed_by_master IS NULL AND NOT complete
            "#,
        )
        .bind(master.get())
        .bind(raw_ids(ids))
        .execute(&mut *tx)
        .await?;

        // Another master got at least one of them first.
        if result.rows_affected() != ids.len() as u64 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn unclaim_build_requests(
        &self,
        ids: &[BuildRequestId],
        master: MasterId,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE buildrequests
            SET claimed_by_master = NULL, claimed_at = NULL
            WHERE id = ANY($1) AND claimed_by_master = $2 AND NOT complete
            "#,
        )
        .bind(raw_ids(ids))
        .bind(master.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        result: BuildResult,
    ) -> DbResult<()> {
        sqlx::query("UPDATE buildrequests SET complete = TRUE, results = $2 WHERE id = ANY($1)")
            .bind(raw_ids(ids))
            .bind(result.code())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_unclaimed_build_requests(
        &self,
        builder_name: &str,
    ) -> DbResult<Vec<BuildRequest>> {
        let query = format!(
            "{} WHERE br.builder_name = $1 AND br.claimed_by_master IS NULL AND NOT br.complete \
             ORDER BY br.priority DESC, br.submitted_at, br.id",
            SELECT_BUILD_REQUEST
        );
        let rows = sqlx::query_as::<_, BuildRequestRecord>(&query)
            .bind(builder_name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_build_request(&self, id: BuildRequestId) -> DbResult<BuildRequest> {
        let query = format!("{} WHERE br.id = $1", SELECT_BUILD_REQUEST);
        let row = sqlx::query_as::<_, BuildRequestRecord>(&query)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build request {}", id)))?;
        Ok(row.into())
    }
}
