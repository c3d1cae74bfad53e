//! Transaction ledger
//!
//! One row per gateway purchase event. The UNIQUE index on
//! `external_transaction_id` is the idempotency anchor: recording is a single
//! atomic insert-on-conflict, and a replayed id comes back as
//! `created = false` rather than an error. Consumable grants hang off the
//! ledger so callers can gate them on that flag.

use sqlx::PgPool;
use uuid::Uuid;

use lovebird_shared::types::{Transaction, TransactionKind};

use crate::catalog::ConsumableProduct;
use crate::error::{BillingError, BillingResult};
use crate::snapshot::SnapshotService;

/// Input for recording a ledger row
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub external_transaction_id: String,
    pub external_original_transaction_id: Option<String>,
    pub product_id: String,
    pub kind: TransactionKind,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

/// Result of [`LedgerService::record_if_new`]
#[derive(Debug, Clone)]
pub struct LedgerOutcome {
    /// False when the external transaction id had already been recorded
    pub created: bool,
    pub transaction: Transaction,
}

/// Service for the purchase ledger
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a transaction unless its external id is already present.
    ///
    /// Single atomic statement. Two tasks racing on the same id get one
    /// `created = true` and one `created = false`, never two rows and never
    /// an error.
    ///
    /// Callers record only gateway-confirmed charges, so rows are born
    /// `completed`; refunds overwrite the status later.
    pub async fn record_if_new(&self, new: NewTransaction) -> BillingResult<LedgerOutcome> {
        let inserted = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO transactions (
                user_id, external_transaction_id, external_original_transaction_id,
                product_id, kind, amount_cents, currency, status, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'completed', NOW())
            ON CONFLICT (external_transaction_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(&new.external_transaction_id)
        .bind(&new.external_original_transaction_id)
        .bind(&new.product_id)
        .bind(new.kind)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(transaction) = inserted {
            tracing::info!(
                user_id = %transaction.user_id,
                external_transaction_id = %transaction.external_transaction_id,
                product_id = %transaction.product_id,
                "Recorded ledger transaction"
            );
            return Ok(LedgerOutcome {
                created: true,
                transaction,
            });
        }

        // Conflict path: hand back the row that beat us
        let transaction = self
            .find_by_external_id(&new.external_transaction_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Transaction '{}' conflicted on insert but was not found",
                    new.external_transaction_id
                ))
            })?;

        tracing::info!(
            external_transaction_id = %new.external_transaction_id,
            "Transaction already recorded, skipping"
        );

        Ok(LedgerOutcome {
            created: false,
            transaction,
        })
    }

    pub async fn find_by_external_id(
        &self,
        external_transaction_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let transaction = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE external_transaction_id = $1",
        )
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(transaction)
    }

    /// Mark a ledger row refunded and stamp its processed time
    pub async fn mark_refunded(
        &self,
        external_transaction_id: &str,
    ) -> BillingResult<Transaction> {
        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            UPDATE transactions
            SET status = 'refunded', processed_at = NOW()
            WHERE external_transaction_id = $1
            RETURNING *
            "#,
        )
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!(
                "No transaction with external id '{}'",
                external_transaction_id
            ))
        })?;

        tracing::info!(
            user_id = %transaction.user_id,
            external_transaction_id = %external_transaction_id,
            "Marked transaction refunded"
        );

        Ok(transaction)
    }

    /// Credit a consumable purchase to the buyer's snapshot.
    ///
    /// Callers invoke this only after `record_if_new` reported
    /// `created = true`, so a replayed receipt never double-credits.
    pub async fn grant_consumable(
        &self,
        user_id: Uuid,
        product: &ConsumableProduct,
    ) -> BillingResult<()> {
        SnapshotService::new(self.pool.clone())
            .grant_consumables(user_id, product.boosts, product.super_likes)
            .await?;

        tracing::info!(
            user_id = %user_id,
            product_id = %product.product_id,
            boosts = product.boosts,
            super_likes = product.super_likes,
            "Granted consumable purchase"
        );

        Ok(())
    }

    /// Transactions that never received a terminal status (scheduler support)
    pub async fn pending_transactions(&self, limit: i64) -> BillingResult<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM transactions
            WHERE status IS NULL AND processed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }
}
