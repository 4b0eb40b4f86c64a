use crate::error::DbError;
use crate::models::ExecutionVariableRow;
use cryton_core::ExecutionVariable;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct ExecutionVariableRepository {
    pool: SqlitePool,
}

impl ExecutionVariableRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, variable: &ExecutionVariable) -> Result<(), DbError> {
        let row = ExecutionVariableRow::from(variable);

        sqlx::query(
            r#"
            INSERT INTO execution_variables (id, plan_execution_id, name, value)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (plan_execution_id, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&row.id)
        .bind(&row.plan_execution_id)
        .bind(&row.name)
        .bind(&row.value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_plan_execution(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<ExecutionVariable>, DbError> {
        let rows: Vec<ExecutionVariableRow> = sqlx::query_as(
            r#"
            SELECT id, plan_execution_id, name, value
            FROM execution_variables
            WHERE plan_execution_id = ?
            ORDER BY name
            "#,
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn delete(&self, plan_execution_id: Uuid, name: &str) -> Result<bool, DbError> {
        let result =
            sqlx::query("DELETE FROM execution_variables WHERE plan_execution_id = ? AND name = ?")
                .bind(plan_execution_id.to_string())
                .bind(name)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_plan_execution, setup_test_db};
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_keeps_value_types() {
        let (_dir, pool) = setup_test_db().await;
        let plan_execution = sample_plan_execution(&pool).await;
        let repo = ExecutionVariableRepository::new(pool);

        repo.upsert(&ExecutionVariable::new(plan_execution.id, "target", json!("10.0.0.1")))
            .await
            .unwrap();
        repo.upsert(&ExecutionVariable::new(plan_execution.id, "ports", json!([22, 80])))
            .await
            .unwrap();
        repo.upsert(&ExecutionVariable::new(plan_execution.id, "target", json!("10.0.0.2")))
            .await
            .unwrap();

        let variables = repo.find_by_plan_execution(plan_execution.id).await.unwrap();
        assert_eq!(variables.len(), 2);
        assert_eq!(variables[0].name, "ports");
        assert_eq!(variables[0].value, json!([22, 80]));
        assert_eq!(variables[1].value, json!("10.0.0.2"));

        assert!(repo.delete(plan_execution.id, "ports").await.unwrap());
    }
}
