// PostgreSQL storage implementation.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{Charge, ChargeStatus, CustomerSummary, MerchantStats, Store, User};
use crate::channel::ChannelAddress;
use crate::error::StoreError;

/// PostgreSQL storage backend
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a new pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables on startup when missing.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id VARCHAR(255) PRIMARY KEY,
                payment_identifier VARCHAR(255) NOT NULL,
                handle VARCHAR(50) UNIQUE NOT NULL,
                channel_address VARCHAR(80) UNIQUE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS charges (
                id VARCHAR(255) PRIMARY KEY,
                merchant_id VARCHAR(255) NOT NULL REFERENCES users(id),
                customer_id VARCHAR(255) REFERENCES users(id),
                customer_handle VARCHAR(50),
                amount NUMERIC(10, 2) NOT NULL,
                notes TEXT NOT NULL DEFAULT '',
                status VARCHAR(20) NOT NULL DEFAULT 'PENDING',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("✅ Database tables checked/created");
        Ok(())
    }
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> Result<User, StoreError> {
    let address: String = row.try_get("channel_address")?;
    Ok(User {
        id: row.try_get("id")?,
        payment_identifier: row.try_get("payment_identifier")?,
        handle: row.try_get("handle")?,
        channel_address: ChannelAddress::from_str(&address)?,
        created_at: row.try_get("created_at")?,
    })
}

fn charge_from_row(row: &sqlx::postgres::PgRow) -> Result<Charge, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Charge {
        id: row.try_get("id")?,
        merchant_id: row.try_get("merchant_id")?,
        customer_id: row.try_get("customer_id")?,
        customer_handle: row.try_get("customer_handle")?,
        amount: row.try_get("amount")?,
        notes: row.try_get("notes")?,
        status: ChargeStatus::from_str(&status)?,
        created_at: row.try_get("created_at")?,
    })
}

const USER_COLUMNS: &str = "id, payment_identifier, handle, channel_address, created_at";
const CHARGE_COLUMNS: &str =
    "id, merchant_id, customer_id, customer_handle, amount, notes, status, created_at";

#[async_trait]
impl Store for PostgresStore {
    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, payment_identifier, handle, channel_address, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                payment_identifier = EXCLUDED.payment_identifier,
                handle = EXCLUDED.handle,
                channel_address = EXCLUDED.channel_address
            "#,
        )
        .bind(&user.id)
        .bind(&user.payment_identifier)
        .bind(&user.handle)
        .bind(user.channel_address.to_string())
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        info!("[DB] Saved user: {}", user.handle);
        Ok(())
    }

    async fn find_user_by_handle(&self, handle: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE handle = $1",
            USER_COLUMNS
        ))
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_channel(
        &self,
        address: &ChannelAddress,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE channel_address = $1",
            USER_COLUMNS
        ))
        .bind(address.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn save_charge(&self, charge: &Charge) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO charges (id, merchant_id, customer_id, customer_handle,
                                 amount, notes, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&charge.id)
        .bind(&charge.merchant_id)
        .bind(&charge.customer_id)
        .bind(&charge.customer_handle)
        .bind(charge.amount)
        .bind(&charge.notes)
        .bind(charge.status.as_str())
        .bind(charge.created_at)
        .execute(&self.pool)
        .await?;

        info!("[DB] Saved charge: {}", charge.id);
        Ok(())
    }

    async fn find_charge(&self, id: &str) -> Result<Option<Charge>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM charges WHERE id = $1",
            CHARGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(charge_from_row).transpose()
    }

    async fn claim_charge(
        &self,
        id: &str,
        customer: &User,
    ) -> Result<Option<Charge>, StoreError> {
        // Single conditional update: only a PENDING charge can be claimed, so
        // concurrent redemptions of the same id resolve to exactly one winner.
        let row = sqlx::query(&format!(
            r#"
            UPDATE charges
            SET status = 'IN_PROGRESS', customer_id = $2, customer_handle = $3
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            CHARGE_COLUMNS
        ))
        .bind(id)
        .bind(&customer.id)
        .bind(&customer.handle)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(charge_from_row).transpose()
    }

    async fn release_charge(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE charges SET status = 'PENDING' WHERE id = $1 AND status = 'IN_PROGRESS'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        info!("[DB] Released charge {} back to PENDING", id);
        Ok(())
    }

    async fn complete_charge(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE charges SET status = 'COMPLETE' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        info!("[DB] Updated charge {} status to COMPLETE", id);
        Ok(())
    }

    async fn merchant_stats(&self, merchant_id: &str) -> Result<MerchantStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE((SELECT SUM(amount) FROM charges
                          WHERE merchant_id = $1 AND status = 'COMPLETE'), 0) AS pending_settlement,
                (SELECT COUNT(*) FROM charges WHERE merchant_id = $1) AS total_transactions,
                (SELECT COUNT(DISTINCT customer_id) FROM charges
                 WHERE merchant_id = $1 AND customer_id IS NOT NULL) AS unique_customers
            "#,
        )
        .bind(merchant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(MerchantStats {
            pending_settlement: row.try_get::<Decimal, _>("pending_settlement")?,
            total_transactions: row.try_get("total_transactions")?,
            unique_customers: row.try_get("unique_customers")?,
        })
    }

    async fn merchant_charges(&self, merchant_id: &str) -> Result<Vec<Charge>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM charges WHERE merchant_id = $1 ORDER BY created_at DESC",
            CHARGE_COLUMNS
        ))
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(charge_from_row).collect()
    }

    async fn merchant_customers(
        &self,
        merchant_id: &str,
    ) -> Result<Vec<CustomerSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                customer_handle,
                COUNT(*) AS transaction_count,
                SUM(amount) AS total_spent,
                MAX(created_at) AS last_seen
            FROM charges
            WHERE merchant_id = $1 AND customer_handle IS NOT NULL
            GROUP BY customer_handle
            ORDER BY total_spent DESC
            "#,
        )
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CustomerSummary {
                    customer_handle: row.try_get("customer_handle")?,
                    transaction_count: row.try_get("transaction_count")?,
                    total_spent: row.try_get::<Decimal, _>("total_spent")?,
                    last_seen: row.try_get::<DateTime<Utc>, _>("last_seen")?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
