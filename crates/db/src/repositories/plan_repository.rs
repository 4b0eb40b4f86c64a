use crate::error::DbError;
use crate::models::PlanRow;
use cryton_core::{Plan, PlanTemplate};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct PlanRepository {
    pool: SqlitePool,
}

impl PlanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, plan: &Plan) -> Result<Plan, DbError> {
        let row = PlanRow::try_from_domain(plan)?;

        sqlx::query(
            r#"
            INSERT INTO plans (id, name, dynamic, document, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(row.dynamic)
        .bind(&row.document)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(plan.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Plan>, DbError> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, dynamic, document, created_at
            FROM plans
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()).transpose()?)
    }

    pub async fn find_all(&self) -> Result<Vec<Plan>, DbError> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, dynamic, document, created_at
            FROM plans
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| r.into_domain().map_err(DbError::from))
            .collect()
    }

    /// Replaces the stored template. Only dynamic plans are extended after creation.
    pub async fn update_template(&self, id: Uuid, template: &PlanTemplate) -> Result<bool, DbError> {
        let document = serde_json::to_string(template)?;

        let result = sqlx::query("UPDATE plans SET document = ? WHERE id = ?")
            .bind(document)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM plans WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_db;
    use cryton_core::parse_plan_document;
    use serde_json::json;

    fn template() -> PlanTemplate {
        parse_plan_document(&json!({
            "name": "scan",
            "stages": [{
                "name": "s1",
                "trigger_type": "delta",
                "trigger_args": {"seconds": 0},
                "steps": [{
                    "name": "a",
                    "step_type": "worker-execute",
                    "is_init": true,
                    "arguments": {"module": "cmd", "module_arguments": {"cmd": "id"}}
                }]
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find_plan() {
        let (_dir, pool) = setup_test_db().await;
        let repo = PlanRepository::new(pool);

        let plan = Plan::new(template());
        repo.create(&plan).await.unwrap();

        let found = repo.find_by_id(plan.id).await.unwrap().unwrap();
        assert_eq!(found.name, "scan");
        assert_eq!(found.template.stages[0].steps[0].name, "a");
        assert_eq!(repo.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_template_and_delete() {
        let (_dir, pool) = setup_test_db().await;
        let repo = PlanRepository::new(pool);

        let plan = Plan::new(template());
        repo.create(&plan).await.unwrap();

        let mut updated = plan.template.clone();
        updated.stages[0].name = "renamed".to_string();
        assert!(repo.update_template(plan.id, &updated).await.unwrap());

        let found = repo.find_by_id(plan.id).await.unwrap().unwrap();
        assert_eq!(found.template.stages[0].name, "renamed");

        assert!(repo.delete(plan.id).await.unwrap());
        assert!(repo.find_by_id(plan.id).await.unwrap().is_none());
    }
}
