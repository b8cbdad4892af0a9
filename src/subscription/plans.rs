/// Membership plan catalog with an in-process read cache
use crate::{
    db::subscription::MembershipPlan,
    error::{CoreError, CoreResult},
    metrics,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::{Arc, RwLock};
use validator::Validate;

/// Plan fields for admin create/update
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewPlan {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub price: i64,
    #[validate(range(min = 1, max = 3650))]
    pub duration_days: i64,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Plans are read on every subscribe and renew but only change through the
/// admin operations here, which drop the cache.
pub struct PlanCatalog {
    db: SqlitePool,
    cache: RwLock<Option<Arc<Vec<MembershipPlan>>>>,
}

impl PlanCatalog {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            cache: RwLock::new(None),
        }
    }

    /// All plans, ordered by id
    pub async fn list_plans(&self) -> CoreResult<Arc<Vec<MembershipPlan>>> {
        if let Some(plans) = self.cached() {
            metrics::record_cache_access("membership_plan", true);
            return Ok(plans);
        }
        metrics::record_cache_access("membership_plan", false);

        let rows = sqlx::query(
            "SELECT id, name, description, price, duration_days, features
             FROM membership_plan ORDER BY id",
        )
        .fetch_all(&self.db)
        .await?;

        let plans = Arc::new(
            rows.iter()
                .map(MembershipPlan::from_row)
                .collect::<CoreResult<Vec<_>>>()?,
        );

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&plans));
        Ok(plans)
    }

    pub async fn get_plan(&self, plan_id: i64) -> CoreResult<MembershipPlan> {
        self.list_plans()
            .await?
            .iter()
            .find(|plan| plan.id == plan_id)
            .cloned()
            .ok_or(CoreError::PlanNotFound(plan_id))
    }

    pub async fn create_plan(&self, plan: NewPlan) -> CoreResult<MembershipPlan> {
        plan.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let id = sqlx::query(
            "INSERT INTO membership_plan (name, description, price, duration_days, features)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(plan.duration_days)
        .bind(encode_features(&plan.features)?)
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        self.invalidate();
        tracing::info!(plan_id = id, name = %plan.name, "Membership plan created");

        self.get_plan(id).await
    }

    pub async fn update_plan(&self, plan_id: i64, plan: NewPlan) -> CoreResult<MembershipPlan> {
        plan.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE membership_plan
             SET name = ?1, description = ?2, price = ?3, duration_days = ?4, features = ?5
             WHERE id = ?6",
        )
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(plan.duration_days)
        .bind(encode_features(&plan.features)?)
        .bind(plan_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::PlanNotFound(plan_id));
        }

        self.invalidate();
        tracing::info!(plan_id, "Membership plan updated");

        self.get_plan(plan_id).await
    }

    /// Drop cached plans; the next read goes to the database
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn cached(&self) -> Option<Arc<Vec<MembershipPlan>>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::clone)
    }
}

fn encode_features(features: &[String]) -> CoreResult<String> {
    serde_json::to_string(features)
        .map_err(|e| CoreError::Internal(format!("Failed to encode plan features: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    async fn create_test_catalog() -> (PlanCatalog, SqlitePool, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool(&dir.path().join("plans.sqlite"), db::DatabaseOptions::default())
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        (PlanCatalog::new(pool.clone()), pool, dir)
    }

    #[tokio::test]
    async fn test_seeded_plans() {
        let (catalog, _pool, _dir) = create_test_catalog().await;
        let plans = catalog.list_plans().await.unwrap();

        let durations: Vec<i64> = plans.iter().map(|p| p.duration_days).collect();
        assert_eq!(durations, vec![30, 90, 180, 365]);
        assert_eq!(plans[0].price, 99000);
        assert!(!plans[0].features.is_empty());

        assert!(matches!(
            catalog.get_plan(999).await,
            Err(CoreError::PlanNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_cache_is_invalidated_by_admin_edits() {
        let (catalog, pool, _dir) = create_test_catalog().await;
        let before = catalog.get_plan(1).await.unwrap();

        // Out-of-band edits stay invisible until invalidation
        sqlx::query("UPDATE membership_plan SET price = 1 WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(catalog.get_plan(1).await.unwrap().price, before.price);

        let updated = catalog
            .update_plan(
                1,
                NewPlan {
                    name: "30 Day Plan".to_string(),
                    description: None,
                    price: 109000,
                    duration_days: 30,
                    features: vec!["Quit plan builder".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.price, 109000);
        assert_eq!(catalog.get_plan(1).await.unwrap().price, 109000);
    }

    #[tokio::test]
    async fn test_create_plan_validates() {
        let (catalog, _pool, _dir) = create_test_catalog().await;

        let invalid = catalog
            .create_plan(NewPlan {
                name: "Broken".to_string(),
                description: None,
                price: 1000,
                duration_days: 0,
                features: vec![],
            })
            .await;
        assert!(matches!(invalid, Err(CoreError::Validation(_))));

        let created = catalog
            .create_plan(NewPlan {
                name: "7 Day Trial".to_string(),
                description: Some("Short trial".to_string()),
                price: 0,
                duration_days: 7,
                features: vec!["Daily journal".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(created.duration_days, 7);
        assert_eq!(catalog.list_plans().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_update_missing_plan() {
        let (catalog, _pool, _dir) = create_test_catalog().await;
        let result = catalog
            .update_plan(
                77,
                NewPlan {
                    name: "Ghost".to_string(),
                    description: None,
                    price: 1,
                    duration_days: 1,
                    features: vec![],
                },
            )
            .await;
        assert!(matches!(result, Err(CoreError::PlanNotFound(77))));
    }
}
