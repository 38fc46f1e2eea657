//! PostgreSQL ledger store

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use creditline_shared::{CreditPackage, CreditTransaction, User};

use crate::error::{BillingError, BillingResult};
use crate::matching::AppUserCandidates;
use crate::store::{
    next_balance, AppliedWrite, CreditResult, LedgerCommit, LedgerStore, LedgerWrite,
    WebhookMarker,
};

const USER_COLUMNS: &str = "id, credits, billing_customer_id, subscription_status, \
     subscription_product_id, subscription_expires_at, created_at, updated_at, deleted_at";

const TRANSACTION_COLUMNS: &str =
    "id, user_id, type, amount, balance_after, external_transaction_id, product_id, created_at";

/// Ledger store backed by the `users`, `credit_transactions`,
/// `processed_webhook_events` and `credit_packages` tables
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_user_by_app_user_ids(
        &self,
        candidates: &AppUserCandidates,
    ) -> BillingResult<Option<User>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let ids: Vec<Uuid> = candidates
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect();
        if !ids.is_empty() {
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users \
                 WHERE id = ANY($1) AND deleted_at IS NULL \
                 ORDER BY array_position($1, id) LIMIT 1"
            );
            let user = sqlx::query_as::<_, User>(&sql)
                .bind(&ids)
                .fetch_optional(&self.pool)
                .await?;
            if user.is_some() {
                return Ok(user);
            }
        }

        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE billing_customer_id = ANY($1) AND deleted_at IS NULL \
             ORDER BY array_position($1::text[], billing_customer_id::text), created_at, id \
             LIMIT 1"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(candidates.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_transaction(
        &self,
        user_id: Uuid,
        external_transaction_id: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 AND external_transaction_id = $2"
        );
        let tx = sqlx::query_as::<_, CreditTransaction>(&sql)
            .bind(user_id)
            .bind(external_transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tx)
    }

    async fn list_packages(&self) -> BillingResult<Vec<CreditPackage>> {
        let packages = sqlx::query_as::<_, CreditPackage>(
            r#"
            SELECT id, name, credits, bonus_percentage, price_cents,
                   provider_product_id, provider_package_id, package_type
            FROM credit_packages
            WHERE deleted_at IS NULL
            ORDER BY credits ASC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(packages)
    }

    async fn webhook_event_exists(&self, event_id: &str) -> BillingResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_webhook_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_webhook_event(&self, marker: &WebhookMarker) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&marker.event_id)
        .bind(&marker.event_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_billing_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<User> {
        let sql = format!(
            "UPDATE users SET billing_customer_id = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {USER_COLUMNS}"
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }

    async fn commit(&self, write: LedgerWrite) -> BillingResult<LedgerCommit> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises every balance change for this user
        let lock_sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let user = sqlx::query_as::<_, User>(&lock_sql)
            .bind(write.user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(write.user_id.to_string()))?;

        if let Some(marker) = &write.webhook_event {
            let inserted = sqlx::query(
                r#"
                INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&marker.event_id)
            .bind(&marker.event_type)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                tx.rollback().await?;
                return Ok(LedgerCommit::DuplicateEvent);
            }
        }

        let mut credits = user.credits;
        let credit = match &write.credit {
            None => None,
            Some(entry) => {
                let next = next_balance(user.credits, entry.amount)?;
                let insert_sql = format!(
                    "INSERT INTO credit_transactions \
                     (id, user_id, type, amount, balance_after, external_transaction_id, product_id, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
                     ON CONFLICT (user_id, external_transaction_id) \
                     WHERE external_transaction_id IS NOT NULL DO NOTHING \
                     RETURNING {TRANSACTION_COLUMNS}"
                );
                let inserted = sqlx::query_as::<_, CreditTransaction>(&insert_sql)
                    .bind(Uuid::new_v4())
                    .bind(user.id)
                    .bind(entry.kind)
                    .bind(entry.amount)
                    .bind(next)
                    .bind(&entry.external_transaction_id)
                    .bind(&entry.product_id)
                    .fetch_optional(&mut *tx)
                    .await?;

                match inserted {
                    Some(row) => {
                        credits = next;
                        Some(CreditResult::Recorded(row))
                    }
                    None => {
                        let ext = entry.external_transaction_id.as_deref().ok_or_else(|| {
                            BillingError::Internal("ledger insert skipped without a key".to_string())
                        })?;
                        let existing_sql = format!(
                            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
                             WHERE user_id = $1 AND external_transaction_id = $2"
                        );
                        let existing = sqlx::query_as::<_, CreditTransaction>(&existing_sql)
                            .bind(user.id)
                            .bind(ext)
                            .fetch_one(&mut *tx)
                            .await?;
                        Some(CreditResult::AlreadyRecorded(existing))
                    }
                }
            }
        };

        let subscription = write.subscription.unwrap_or_default();
        let update_sql = format!(
            "UPDATE users SET \
                 credits = $2, \
                 subscription_status = COALESCE($3, subscription_status), \
                 subscription_product_id = COALESCE($4, subscription_product_id), \
                 subscription_expires_at = COALESCE($5, subscription_expires_at), \
                 billing_customer_id = COALESCE(billing_customer_id, $6), \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&update_sql)
            .bind(user.id)
            .bind(credits)
            .bind(subscription.status)
            .bind(subscription.product_id)
            .bind(subscription.expires_at)
            .bind(write.link_customer_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(LedgerCommit::Applied(AppliedWrite { user, credit }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CreditEntry;
    use creditline_shared::CreditTransactionType;

    async fn store() -> PgLedgerStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = creditline_shared::create_pool(&url, 4).await.unwrap();
        creditline_shared::run_migrations(&pool).await.unwrap();
        PgLedgerStore::new(pool)
    }

    async fn insert_user(store: &PgLedgerStore, credits: i32) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, credits) VALUES ($1, $2)")
            .bind(id)
            .bind(credits)
            .execute(store.pool())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_concurrent_commits_grant_once() {
        let store = store().await;
        let user_id = insert_user(&store, 10).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .commit(LedgerWrite::for_user(user_id).credit(CreditEntry {
                        kind: CreditTransactionType::Purchase,
                        amount: 110,
                        external_transaction_id: Some("pg-concurrent-tx".to_string()),
                        product_id: Some("com.example.credits_100".to_string()),
                    }))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let user = store.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.credits, 120);
        assert!(store
            .find_transaction(user_id, "pg-concurrent-tx")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_long_unrecognised_event_type_is_recorded() {
        let store = store().await;
        let marker = WebhookMarker {
            event_id: format!("evt-{}", Uuid::new_v4()),
            event_type: "SOME_FUTURE_EVENT_".repeat(12),
        };
        assert!(store.record_webhook_event(&marker).await.unwrap());
        assert!(store.webhook_event_exists(&marker.event_id).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_duplicate_marker_rolls_back() {
        let store = store().await;
        let user_id = insert_user(&store, 10).await;
        let marker = WebhookMarker {
            event_id: format!("evt-{}", Uuid::new_v4()),
            event_type: "INITIAL_PURCHASE".to_string(),
        };
        assert!(store.record_webhook_event(&marker).await.unwrap());

        let commit = store
            .commit(
                LedgerWrite::for_user(user_id)
                    .credit(CreditEntry {
                        kind: CreditTransactionType::Purchase,
                        amount: 100,
                        external_transaction_id: Some(format!("tx-{}", Uuid::new_v4())),
                        product_id: None,
                    })
                    .webhook_event(marker),
            )
            .await
            .unwrap();
        assert!(matches!(commit, LedgerCommit::DuplicateEvent));
        assert_eq!(store.get_user(user_id).await.unwrap().unwrap().credits, 10);
    }
}
