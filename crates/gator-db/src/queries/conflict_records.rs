//! Database query functions for the `conflict_records` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ConflictLayer, ConflictRecord, ConflictResolution};

/// Parameters for inserting a new conflict record row.
#[derive(Debug, Clone)]
pub struct NewConflictRecord {
    pub plan_id: Uuid,
    pub task_a_id: Uuid,
    pub task_b_id: Uuid,
    pub files: Vec<String>,
    pub layer: ConflictLayer,
    pub resolution: ConflictResolution,
    pub detail: Option<String>,
}

/// Insert a new conflict record. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_conflict_record(
    pool: &PgPool,
    new: &NewConflictRecord,
) -> Result<ConflictRecord> {
    let resolved_at = match new.resolution {
        ConflictResolution::Resolved => Some(chrono::Utc::now()),
        ConflictResolution::Unresolved => None,
    };

    let record = sqlx::query_as::<_, ConflictRecord>(
        "INSERT INTO conflict_records \
         (plan_id, task_a_id, task_b_id, files, layer, resolution, detail, resolved_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.plan_id)
    .bind(new.task_a_id)
    .bind(new.task_b_id)
    .bind(&new.files)
    .bind(new.layer)
    .bind(new.resolution)
    .bind(&new.detail)
    .bind(resolved_at)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert conflict record for plan {}", new.plan_id))?;

    Ok(record)
}

/// List every conflict record for a plan, most recent first.
pub async fn list_conflicts_for_plan(pool: &PgPool, plan_id: Uuid) -> Result<Vec<ConflictRecord>> {
    let records = sqlx::query_as::<_, ConflictRecord>(
        "SELECT * FROM conflict_records WHERE plan_id = $1 ORDER BY created_at DESC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list conflict records for plan {}", plan_id))?;

    Ok(records)
}

/// List only the unresolved conflict records for a plan.
pub async fn list_unresolved_conflicts(
    pool: &PgPool,
    plan_id: Uuid,
) -> Result<Vec<ConflictRecord>> {
    let records = sqlx::query_as::<_, ConflictRecord>(
        "SELECT * FROM conflict_records \
         WHERE plan_id = $1 AND resolution = 'unresolved' \
         ORDER BY created_at ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list unresolved conflicts for plan {}", plan_id))?;

    Ok(records)
}
