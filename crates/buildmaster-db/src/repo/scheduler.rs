//! Scheduler state repository: change classifications.

use async_trait::async_trait;
use buildmaster_core::{ChangeId, ChangeKey, SchedulerId};
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::DbResult;

/// Which classified changes to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationFilter {
    All,
    /// Only changes on this line of development.
    Matching(ChangeKey),
}

#[async_trait]
pub trait SchedulerRepo: Send + Sync {
    /// The id registered for the scheduler called `name`, registering it
    /// on first use. Stable across restarts.
    async fn find_scheduler_id(&self, name: &str) -> DbResult<SchedulerId>;

    /// Record whether each change is important to the scheduler. Re-recording
    /// a change overwrites its previous classification.
    async fn classify_changes(
        &self,
        scheduler: SchedulerId,
        classifications: &BTreeMap<ChangeId, bool>,
    ) -> DbResult<()>;

    async fn get_change_classifications(
        &self,
        scheduler: SchedulerId,
        filter: &ClassificationFilter,
    ) -> DbResult<BTreeMap<ChangeId, bool>>;

    /// Delete classifications selected by `filter` with a change id below
    /// `less_than`, or all selected ones when `less_than` is `None`.
    async fn flush_change_classifications(
        &self,
        scheduler: SchedulerId,
        filter: &ClassificationFilter,
        less_than: Option<ChangeId>,
    ) -> DbResult<()>;
}

/// PostgreSQL implementation of SchedulerRepo.
pub struct PgSchedulerRepo {
    pool: PgPool,
}

impl PgSchedulerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchedulerRepo for PgSchedulerRepo {
    async fn find_scheduler_id(&self, name: &str) -> DbResult<SchedulerId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO schedulers (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(SchedulerId(id))
    }

    async fn classify_changes(
        &self,
        scheduler: SchedulerId,
        classifications: &BTreeMap<ChangeId, bool>,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for (change_id, important) in classifications {
            sqlx::query(
                r#"
                INSERT INTO scheduler_changes (scheduler_id, change_id, important)
                VALUES ($1, $2, $3)
                ON CONFLICT (scheduler_id, change_id) DO UPDATE SET important = EXCLUDED.important
                "#,
            )
            .bind(scheduler.get())
            .bind(change_id.get())
            .bind(*important)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_change_classifications(
        &self,
        scheduler: SchedulerId,
        filter: &ClassificationFilter,
    ) -> DbResult<BTreeMap<ChangeId, bool>> {
        let rows: Vec<(i64, bool)> = match filter {
            ClassificationFilter::All => {
                sqlx::query_as(
                    "SELECT change_id, important FROM scheduler_changes WHERE scheduler_id = $1",
                )
                .bind(scheduler.get())
                .fetch_all(&self.pool)
                .await?
            }
            ClassificationFilter::Matching(key) => {
                sqlx::query_as(
                    r#"
                    SELECT sc.change_id, sc.important
                    FROM scheduler_changes sc
                    JOIN changes c ON c.id = sc.change_id
                    WHERE sc.scheduler_id = $1
                      AND c.codebase = $2
                      AND c.project = $3
                      AND c.repository = $4
                      AND c.branch IS NOT DISTINCT FROM $5
                    "#,
                )
                .bind(scheduler.get())
                .bind(&key.codebase)
                .bind(&key.project)
                .bind(&key.repository)
                .bind(&key.branch)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|(id, important)| (ChangeId(id), important))
            .collect())
    }

    async fn flush_change_classifications(
        &self,
        scheduler: SchedulerId,
        filter: &ClassificationFilter,
        less_than: Option<ChangeId>,
    ) -> DbResult<()> {
        let less_than = less_than.map(ChangeId::get);
        match filter {
            ClassificationFilter::All => {
                sqlx::query(
                    r#"
                    DELETE FROM scheduler_changes
                    WHERE scheduler_id = $1 AND ($2::BIGINT IS NULL OR change_id < $2)
                    "#,
                )
                .bind(scheduler.get())
                .bind(less_than)
                .execute(&self.pool)
                .await?;
            }
            ClassificationFilter::Matching(key) => {
                sqlx::query(
                    r#"
                    DELETE FROM scheduler_changes sc
                    USING changes c
                    WHERE c.id = sc.change_id
                      AND sc.scheduler_id = $1
                      AND ($2::BIGINT IS NULL OR sc.change_id < $2)
                      AND c.codebase = $3
                      AND c.project = $4
                      AND c.repository = $5
                      AND c.branch IS NOT DISTINCT FROM $6
                    "#,
                )
                .bind(scheduler.get())
                .bind(less_than)
                .bind(&key.codebase)
                .bind(&key.project)
                .bind(&key.repository)
                .bind(&key.branch)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}
