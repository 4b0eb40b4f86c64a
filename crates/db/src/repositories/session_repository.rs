use crate::error::DbError;
use crate::models::SessionRow;
use cryton_core::Session;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a session. A named session replaces an earlier one with the
    /// same name in the same plan execution.
    pub async fn upsert(&self, session: &Session) -> Result<Session, DbError> {
        let row = SessionRow::from(session);

        sqlx::query(
            r#"
            INSERT INTO sessions (id, plan_execution_id, name, worker_session_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (plan_execution_id, name)
            DO UPDATE SET worker_session_id = excluded.worker_session_id
            "#,
        )
        .bind(&row.id)
        .bind(&row.plan_execution_id)
        .bind(&row.name)
        .bind(&row.worker_session_id)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(session.clone())
    }

    pub async fn find_by_name(
        &self,
        plan_execution_id: Uuid,
        name: &str,
    ) -> Result<Option<Session>, DbError> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, plan_execution_id, name, worker_session_id, created_at
            FROM sessions
            WHERE plan_execution_id = ? AND name = ?
            "#,
        )
        .bind(plan_execution_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_by_plan_execution(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<Session>, DbError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, plan_execution_id, name, worker_session_id, created_at
            FROM sessions
            WHERE plan_execution_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_plan_execution, setup_test_db};

    #[tokio::test]
    async fn test_named_session_is_replaced() {
        let (_dir, pool) = setup_test_db().await;
        let plan_execution = sample_plan_execution(&pool).await;
        let repo = SessionRepository::new(pool);

        repo.upsert(&Session::new(plan_execution.id, Some("shell".into()), "1"))
            .await
            .unwrap();
        repo.upsert(&Session::new(plan_execution.id, Some("shell".into()), "7"))
            .await
            .unwrap();
        repo.upsert(&Session::new(plan_execution.id, None, "9"))
            .await
            .unwrap();

        let found = repo
            .find_by_name(plan_execution.id, "shell")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.worker_session_id, "7");
        assert!(repo
            .find_by_name(plan_execution.id, "other")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            repo.find_by_plan_execution(plan_execution.id)
                .await
                .unwrap()
                .len(),
            2
        );
    }
}
