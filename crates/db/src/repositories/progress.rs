use sqlx::{sqlite::SqliteRow, Row};

use wrkspace_core::domain::approval::{
    ApprovalProgress, ChainId, Decision, EntityType, ProgressId, ProgressStatus, StepDecision,
};

use super::chain::{parse_entity_type, parse_timestamp};
use super::{ProgressRepository, RepositoryError};
use crate::DbPool;

pub struct SqlProgressRepository {
    pool: DbPool,
}

impl SqlProgressRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_decisions(
        &self,
        progress_id: &str,
    ) -> Result<Vec<StepDecision>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT step_order, approver_id, decision, decided_at, comment
             FROM approval_step_decision
             WHERE progress_id = ?
             ORDER BY seq ASC",
        )
        .bind(progress_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_decision).collect()
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<ApprovalProgress, RepositoryError> {
        let mut progress = row_to_progress(row)?;
        progress.step_decisions = self.load_decisions(&progress.id.0).await?;
        Ok(progress)
    }
}

const PROGRESS_COLUMNS: &str = "id, chain_id, entity_type, entity_id, submitted_by, current_step,
                                status, version, created_at, completed_at";

fn row_to_progress(row: &SqliteRow) -> Result<ApprovalProgress, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let chain_id: String =
        row.try_get("chain_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_type: String =
        row.try_get("entity_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_id: String =
        row.try_get("entity_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let submitted_by: String =
        row.try_get("submitted_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let current_step: Option<i64> =
        row.try_get("current_step").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let version: i64 =
        row.try_get("version").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let completed_at: Option<String> =
        row.try_get("completed_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let current_step = current_step
        .map(|step| {
            u32::try_from(step)
                .map_err(|_| RepositoryError::Decode(format!("current_step {step} out of range")))
        })
        .transpose()?;
    let version = u32::try_from(version)
        .map_err(|_| RepositoryError::Decode(format!("version {version} out of range")))?;
    let status = ProgressStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown progress status `{status}`")))?;

    Ok(ApprovalProgress {
        id: ProgressId(id),
        chain_id: ChainId(chain_id),
        entity_type: parse_entity_type(&entity_type)?,
        entity_id,
        submitted_by,
        current_step,
        status,
        step_decisions: Vec::new(),
        version,
        created_at: parse_timestamp("created_at", &created_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|raw| parse_timestamp("completed_at", raw))
            .transpose()?,
    })
}

fn row_to_decision(row: &SqliteRow) -> Result<StepDecision, RepositoryError> {
    let step_order: i64 =
        row.try_get("step_order").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let approver_id: String =
        row.try_get("approver_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let decision: String =
        row.try_get("decision").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let decided_at: String =
        row.try_get("decided_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let comment: Option<String> =
        row.try_get("comment").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(StepDecision {
        step: u32::try_from(step_order)
            .map_err(|_| RepositoryError::Decode(format!("step_order {step_order} out of range")))?,
        approver_id,
        decision: Decision::parse(&decision)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown decision `{decision}`")))?,
        decided_at: parse_timestamp("decided_at", &decided_at)?,
        comment,
    })
}

async fn insert_decisions(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    progress_id: &str,
    decisions: &[StepDecision],
    first_seq: usize,
) -> Result<(), RepositoryError> {
    for (offset, decision) in decisions.iter().enumerate() {
        sqlx::query(
            "INSERT INTO approval_step_decision
                 (progress_id, seq, step_order, approver_id, decision, decided_at, comment)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(progress_id)
        .bind((first_seq + offset) as i64)
        .bind(i64::from(decision.step))
        .bind(&decision.approver_id)
        .bind(decision.decision.as_str())
        .bind(decision.decided_at.to_rfc3339())
        .bind(&decision.comment)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait::async_trait]
impl ProgressRepository for SqlProgressRepository {
    async fn find_by_id(
        &self,
        id: &ProgressId,
    ) -> Result<Option<ApprovalProgress>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {PROGRESS_COLUMNS} FROM approval_progress WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn find_open_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ApprovalProgress>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM approval_progress
             WHERE entity_type = ? AND entity_id = ? AND status = 'pending'"
        ))
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, progress: ApprovalProgress) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO approval_progress (id, chain_id, entity_type, entity_id, submitted_by,
                                            current_step, status, version, created_at,
                                            completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&progress.id.0)
        .bind(&progress.chain_id.0)
        .bind(progress.entity_type.as_str())
        .bind(&progress.entity_id)
        .bind(&progress.submitted_by)
        .bind(progress.current_step.map(i64::from))
        .bind(progress.status.as_str())
        .bind(i64::from(progress.version))
        .bind(progress.created_at.to_rfc3339())
        .bind(progress.completed_at.map(|at| at.to_rfc3339()))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                tx.rollback().await?;
                return Ok(false);
            }
            Err(error) => return Err(error.into()),
        }

        insert_decisions(&mut tx, &progress.id.0, &progress.step_decisions, 0).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        progress: ApprovalProgress,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approval_progress
             SET current_step = ?, status = ?, version = ?, completed_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(progress.current_step.map(i64::from))
        .bind(progress.status.as_str())
        .bind(i64::from(progress.version))
        .bind(progress.completed_at.map(|at| at.to_rfc3339()))
        .bind(&progress.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // Decisions are append-only, so only the tail beyond what is stored is new.
        let (stored,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM approval_step_decision WHERE progress_id = ?",
        )
        .bind(&progress.id.0)
        .fetch_one(&mut *tx)
        .await?;
        let stored = usize::try_from(stored).unwrap_or_default();

        if let Some(new_decisions) = progress.step_decisions.get(stored..) {
            insert_decisions(&mut tx, &progress.id.0, new_decisions, stored).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalProgress>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM approval_progress
             WHERE status = 'pending'
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            pending.push(self.hydrate(row).await?);
        }
        Ok(pending)
    }
}
