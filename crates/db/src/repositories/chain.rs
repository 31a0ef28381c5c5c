use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use wrkspace_core::domain::approval::{
    ApprovalChain, ChainConditions, ChainId, ChainStep, EntityType,
};

use super::{ChainRepository, RepositoryError};
use crate::DbPool;

pub struct SqlChainRepository {
    pool: DbPool,
}

impl SqlChainRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CHAIN_COLUMNS: &str = "id, name, entity_type, steps_json, conditions_json, priority,
                             is_active, created_at, updated_at";

pub(crate) fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{field}: {e}")))
}

pub(crate) fn parse_entity_type(raw: &str) -> Result<EntityType, RepositoryError> {
    EntityType::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown entity_type `{raw}`")))
}

fn row_to_chain(row: &SqliteRow) -> Result<ApprovalChain, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_type: String =
        row.try_get("entity_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let steps_json: String =
        row.try_get("steps_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let conditions_json: String =
        row.try_get("conditions_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let priority: i64 =
        row.try_get("priority").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_active: bool =
        row.try_get("is_active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let steps: Vec<ChainStep> = serde_json::from_str(&steps_json)
        .map_err(|e| RepositoryError::Decode(format!("steps_json for chain `{id}`: {e}")))?;
    let conditions: ChainConditions = serde_json::from_str(&conditions_json)
        .map_err(|e| RepositoryError::Decode(format!("conditions_json for chain `{id}`: {e}")))?;
    let priority = i32::try_from(priority)
        .map_err(|_| RepositoryError::Decode(format!("priority {priority} out of range")))?;

    Ok(ApprovalChain {
        id: ChainId(id),
        name,
        entity_type: parse_entity_type(&entity_type)?,
        steps,
        conditions,
        priority,
        is_active,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

async fn upsert_chain(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chain: &ApprovalChain,
) -> Result<(), RepositoryError> {
    let steps_json =
        serde_json::to_string(&chain.steps).map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let conditions_json = serde_json::to_string(&chain.conditions)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    // created_at is kept on conflict
    sqlx::query(
        "INSERT INTO approval_chain (id, name, entity_type, steps_json, conditions_json,
                                     priority, is_active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             entity_type = excluded.entity_type,
             steps_json = excluded.steps_json,
             conditions_json = excluded.conditions_json,
             priority = excluded.priority,
             is_active = excluded.is_active,
             updated_at = excluded.updated_at",
    )
    .bind(&chain.id.0)
    .bind(&chain.name)
    .bind(chain.entity_type.as_str())
    .bind(&steps_json)
    .bind(&conditions_json)
    .bind(i64::from(chain.priority))
    .bind(chain.is_active)
    .bind(chain.created_at.to_rfc3339())
    .bind(chain.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait::async_trait]
impl ChainRepository for SqlChainRepository {
    async fn find_by_id(&self, id: &ChainId) -> Result<Option<ApprovalChain>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CHAIN_COLUMNS} FROM approval_chain WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_chain).transpose()
    }

    async fn list_active(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<ApprovalChain>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAIN_COLUMNS} FROM approval_chain
             WHERE entity_type = ? AND is_active = 1
             ORDER BY priority ASC, created_at ASC, id ASC"
        ))
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_chain).collect()
    }

    async fn list_all(&self) -> Result<Vec<ApprovalChain>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAIN_COLUMNS} FROM approval_chain
             ORDER BY entity_type ASC, priority ASC, created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_chain).collect()
    }

    async fn save_all(&self, chains: Vec<ApprovalChain>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for chain in &chains {
            upsert_chain(&mut tx, chain).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn set_active(&self, id: &ChainId, is_active: bool) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE approval_chain SET is_active = ?, updated_at = ? WHERE id = ?")
                .bind(is_active)
                .bind(Utc::now().to_rfc3339())
                .bind(&id.0)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}
