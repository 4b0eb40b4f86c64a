use cryton_core::{Plan, PlanTemplate};

use super::{datetime_to_millis, millis_to_datetime, parse_id};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanRow {
    pub id: String,
    pub name: String,
    pub dynamic: bool,
    pub document: String,
    pub created_at: i64,
}

impl PlanRow {
    pub fn into_domain(self) -> Result<Plan, serde_json::Error> {
        let template: PlanTemplate = serde_json::from_str(&self.document)?;
        Ok(Plan {
            id: parse_id(&self.id),
            name: self.name,
            dynamic: self.dynamic,
            template,
            created_at: millis_to_datetime(self.created_at),
        })
    }

    pub fn try_from_domain(plan: &Plan) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: plan.id.to_string(),
            name: plan.name.clone(),
            dynamic: plan.dynamic,
            document: serde_json::to_string(&plan.template)?,
            created_at: datetime_to_millis(plan.created_at),
        })
    }
}
