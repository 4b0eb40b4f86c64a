use crate::error::DbError;
use crate::models::WorkerRow;
use cryton_core::{Worker, WorkerState};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct WorkerRepository {
    pool: SqlitePool,
}

impl WorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, worker: &Worker) -> Result<Worker, DbError> {
        let row = WorkerRow::from(worker);

        sqlx::query(
            r#"
            INSERT INTO workers (id, name, description, state, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.state)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(worker.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Worker>, DbError> {
        let row: Option<WorkerRow> = sqlx::query_as(
            "SELECT id, name, description, state, created_at FROM workers WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Worker>, DbError> {
        let row: Option<WorkerRow> = sqlx::query_as(
            "SELECT id, name, description, state, created_at FROM workers WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_all(&self) -> Result<Vec<Worker>, DbError> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            "SELECT id, name, description, state, created_at FROM workers ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn update_state(&self, id: Uuid, state: WorkerState) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE workers SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
