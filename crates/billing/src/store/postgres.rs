//! PostgreSQL store
//!
//! Each [`UnitOfWork`] runs inside one transaction; any failed statement drops
//! the transaction and nothing is written.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, BillingWrite, ProfileQuery, UnitOfWork};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingAdjustment, BillingProfile, Client, ClientStatus, Invoice, InvoiceStatus,
    NotificationEntry, NotificationPriority, NotificationStatus, NotificationType, Payment,
    PaymentStatus, Subscription, SubscriptionStatus,
};
use crate::period::Period;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> BillingResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    tracing::info!("Database pool created");
    Ok(pool)
}

fn unknown_text(column: &str, value: &str) -> BillingError {
    BillingError::Store(format!("unexpected {column} value '{value}'"))
}

fn to_u32(column: &str, value: i32) -> BillingResult<u32> {
    u32::try_from(value).map_err(|_| BillingError::Store(format!("negative {column}: {value}")))
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    name: String,
    is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    client_id: Uuid,
    billing_day: i32,
    monthly_fee: Decimal,
    grace_days: i32,
    next_due_date: NaiveDate,
    client_status: String,
    service_end_date: Option<NaiveDate>,
    updated_at: OffsetDateTime,
}

impl TryFrom<ProfileRow> for BillingProfile {
    type Error = BillingError;

    fn try_from(row: ProfileRow) -> BillingResult<Self> {
        Ok(BillingProfile {
            client_id: row.client_id,
            billing_day: to_u32("billing_day", row.billing_day)?,
            monthly_fee: row.monthly_fee,
            grace_days: to_u32("grace_days", row.grace_days)?,
            next_due_date: row.next_due_date,
            client_status: ClientStatus::parse(&row.client_status)
                .ok_or_else(|| unknown_text("client_status", &row.client_status))?,
            service_end_date: row.service_end_date,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    client_id: Uuid,
    service_package: String,
    package_active: bool,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    client_id: Uuid,
    subscription_id: Uuid,
    invoice_number: String,
    billing_period_start: NaiveDate,
    billing_period_end: NaiveDate,
    amount: Decimal,
    total_amount: Decimal,
    due_date: NaiveDate,
    status: String,
    superseded_by: Option<String>,
    cancellation_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> BillingResult<Self> {
        Ok(Invoice {
            id: row.id,
            client_id: row.client_id,
            subscription_id: row.subscription_id,
            invoice_number: row.invoice_number,
            billing_period_start: row.billing_period_start,
            billing_period_end: row.billing_period_end,
            amount: row.amount,
            total_amount: row.total_amount,
            due_date: row.due_date,
            status: InvoiceStatus::parse(&row.status)
                .ok_or_else(|| unknown_text("invoice status", &row.status))?,
            superseded_by: row.superseded_by,
            cancellation_reason: row.cancellation_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    client_id: Uuid,
    invoice_id: Option<Uuid>,
    amount: Decimal,
    payment_date: NaiveDate,
    status: String,
    reference: Option<String>,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct AdjustmentRow {
    id: Uuid,
    client_id: Uuid,
    invoice_id: Uuid,
    payment_id: Uuid,
    proportional_amount: Decimal,
    days_remaining: i32,
    reason: String,
    resolved: bool,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    client_id: Uuid,
    notification_type: String,
    title: String,
    message: String,
    priority: String,
    status: String,
    dedupe_key: String,
    created_at: OffsetDateTime,
}

impl TryFrom<NotificationRow> for NotificationEntry {
    type Error = BillingError;

    fn try_from(row: NotificationRow) -> BillingResult<Self> {
        Ok(NotificationEntry {
            id: row.id,
            client_id: row.client_id,
            notification_type: NotificationType::parse(&row.notification_type)
                .ok_or_else(|| unknown_text("notification_type", &row.notification_type))?,
            title: row.title,
            message: row.message,
            priority: NotificationPriority::parse(&row.priority)
                .ok_or_else(|| unknown_text("priority", &row.priority))?,
            status: NotificationStatus::parse(&row.status)
                .ok_or_else(|| unknown_text("notification status", &row.status))?,
            dedupe_key: row.dedupe_key,
            created_at: row.created_at,
        })
    }
}

const INVOICE_COLUMNS: &str = r#"
    id, client_id, subscription_id, invoice_number, billing_period_start,
    billing_period_end, amount, total_amount, due_date, status, superseded_by,
    cancellation_reason, created_at, updated_at
"#;

const PROFILE_COLUMNS: &str = r#"
    client_id, billing_day, monthly_fee, grace_days, next_due_date, client_status,
    service_end_date, updated_at
"#;

fn invoices_from(rows: Vec<InvoiceRow>) -> BillingResult<Vec<Invoice>> {
    rows.into_iter().map(Invoice::try_from).collect()
}

/// [`BillingStore`] backed by PostgreSQL
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn apply(
        tx: &mut Transaction<'static, Postgres>,
        write: BillingWrite,
    ) -> BillingResult<()> {
        let affected = match write {
            BillingWrite::InsertInvoice(invoice) => sqlx::query(
                r#"
                INSERT INTO invoices (
                    id, client_id, subscription_id, invoice_number, billing_period_start,
                    billing_period_end, amount, total_amount, due_date, status,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
                "#,
            )
            .bind(invoice.id)
            .bind(invoice.client_id)
            .bind(invoice.subscription_id)
            .bind(&invoice.invoice_number)
            .bind(invoice.billing_period_start)
            .bind(invoice.billing_period_end)
            .bind(invoice.amount)
            .bind(invoice.total_amount)
            .bind(invoice.due_date)
            .bind(invoice.status.as_str())
            .bind(invoice.created_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),

            BillingWrite::CancelInvoice {
                invoice_id,
                superseded_by,
                reason,
            } => sqlx::query(
                r#"
                UPDATE invoices
                SET status = 'cancelled',
                    superseded_by = $2,
                    cancellation_reason = $3,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(invoice_id)
            .bind(superseded_by)
            .bind(reason)
            .execute(&mut **tx)
            .await?
            .rows_affected(),

            BillingWrite::SetInvoiceStatus { invoice_id, status } => {
                sqlx::query("UPDATE invoices SET status = $2, updated_at = NOW() WHERE id = $1")
                    .bind(invoice_id)
                    .bind(status.as_str())
                    .execute(&mut **tx)
                    .await?
                    .rows_affected()
            }

            BillingWrite::SetNextDueDate {
                client_id,
                next_due_date,
            } => sqlx::query(
                "UPDATE billing_profiles SET next_due_date = $2, updated_at = NOW() WHERE client_id = $1",
            )
            .bind(client_id)
            .bind(next_due_date)
            .execute(&mut **tx)
            .await?
            .rows_affected(),

            BillingWrite::SetClientStatus { client_id, status } => sqlx::query(
                "UPDATE billing_profiles SET client_status = $2, updated_at = NOW() WHERE client_id = $1",
            )
            .bind(client_id)
            .bind(status.as_str())
            .execute(&mut **tx)
            .await?
            .rows_affected(),

            BillingWrite::SetServiceEndDate {
                client_id,
                service_end_date,
            } => sqlx::query(
                "UPDATE billing_profiles SET service_end_date = $2, updated_at = NOW() WHERE client_id = $1",
            )
            .bind(client_id)
            .bind(service_end_date)
            .execute(&mut **tx)
            .await?
            .rows_affected(),

            BillingWrite::InsertPayment(payment) => sqlx::query(
                r#"
                INSERT INTO payments (
                    id, client_id, invoice_id, amount, payment_date, status, reference, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(payment.id)
            .bind(payment.client_id)
            .bind(payment.invoice_id)
            .bind(payment.amount)
            .bind(payment.payment_date)
            .bind(payment.status.as_str())
            .bind(payment.reference)
            .bind(payment.created_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),

            BillingWrite::AssignPayment {
                payment_id,
                invoice_id,
            } => sqlx::query("UPDATE payments SET invoice_id = $2 WHERE id = $1")
                .bind(payment_id)
                .bind(invoice_id)
                .execute(&mut **tx)
                .await?
                .rows_affected(),

            BillingWrite::InsertAdjustment(adjustment) => sqlx::query(
                r#"
                INSERT INTO billing_adjustments (
                    id, client_id, invoice_id, payment_id, proportional_amount,
                    days_remaining, reason, resolved, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(adjustment.id)
            .bind(adjustment.client_id)
            .bind(adjustment.invoice_id)
            .bind(adjustment.payment_id)
            .bind(adjustment.proportional_amount)
            .bind(i32::try_from(adjustment.days_remaining).map_err(|_| {
                BillingError::Store(format!(
                    "days_remaining out of range: {}",
                    adjustment.days_remaining
                ))
            })?)
            .bind(adjustment.reason)
            .bind(adjustment.resolved)
            .bind(adjustment.created_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),

            BillingWrite::EnqueueNotification(entry) => {
                // Duplicate dedupe keys are expected on re-runs and silently ignored
                sqlx::query(
                    r#"
                    INSERT INTO notification_queue (
                        id, client_id, notification_type, title, message, priority,
                        status, dedupe_key, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (dedupe_key) DO NOTHING
                    "#,
                )
                .bind(entry.id)
                .bind(entry.client_id)
                .bind(entry.notification_type.as_str())
                .bind(entry.title)
                .bind(entry.message)
                .bind(entry.priority.as_str())
                .bind(entry.status.as_str())
                .bind(entry.dedupe_key)
                .bind(entry.created_at)
                .execute(&mut **tx)
                .await?;
                1
            }
        };

        if affected == 0 {
            return Err(BillingError::Store(
                "write matched no rows; transaction rolled back".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_client(&self, client_id: Uuid) -> BillingResult<Option<Client>> {
        let row: Option<ClientRow> =
            sqlx::query_as("SELECT id, name, is_active FROM clients WHERE id = $1")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| Client {
            id: r.id,
            name: r.name,
            is_active: r.is_active,
        }))
    }

    async fn get_profile(&self, client_id: Uuid) -> BillingResult<Option<BillingProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(&format!(
            "SELECT {PROFILE_COLUMNS} FROM billing_profiles WHERE client_id = $1"
        ))
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingProfile::try_from).transpose()
    }

    async fn list_profiles(&self, query: &ProfileQuery) -> BillingResult<Vec<BillingProfile>> {
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let rows: Vec<ProfileRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PROFILE_COLUMNS}
            FROM billing_profiles
            WHERE (cardinality($1::text[]) = 0 OR client_status = ANY($1))
              AND ($2::date IS NULL OR next_due_date > $2)
              AND ($3::date IS NULL OR next_due_date <= $3)
            ORDER BY client_id
            "#
        ))
        .bind(&statuses)
        .bind(query.due_after)
        .bind(query.due_on_or_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BillingProfile::try_from).collect()
    }

    async fn active_subscription(&self, client_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, client_id, service_package, package_active, status
            FROM subscriptions
            WHERE client_id = $1
              AND status = 'active'
              AND package_active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(Subscription {
                id: r.id,
                client_id: r.client_id,
                service_package: r.service_package,
                package_active: r.package_active,
                status: SubscriptionStatus::parse(&r.status)
                    .ok_or_else(|| unknown_text("subscription status", &r.status))?,
            })
        })
        .transpose()
    }

    async fn find_period_invoice(
        &self,
        client_id: Uuid,
        period: &Period,
    ) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE client_id = $1
              AND billing_period_start = $2
              AND billing_period_end = $3
              AND status <> 'cancelled'
            LIMIT 1
            "#
        ))
        .bind(client_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn pending_invoices_ending_before(
        &self,
        client_id: Uuid,
        period_end: NaiveDate,
    ) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE client_id = $1
              AND status = 'pending'
              AND billing_period_end < $2
            ORDER BY billing_period_start
            "#
        ))
        .bind(client_id)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;

        invoices_from(rows)
    }

    async fn unpaid_invoices(&self, client_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE client_id = $1
              AND status IN ('pending', 'partial_paid', 'overdue')
            ORDER BY due_date, billing_period_start
            "#
        ))
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        invoices_from(rows)
    }

    async fn list_invoices(&self, client_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE client_id = $1 ORDER BY billing_period_start, created_at"
        ))
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        invoices_from(rows)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> =
            sqlx::query_as(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"))
                .bind(invoice_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, client_id, invoice_id, amount, payment_date, status, reference, created_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(Payment {
                id: r.id,
                client_id: r.client_id,
                invoice_id: r.invoice_id,
                amount: r.amount,
                payment_date: r.payment_date,
                status: PaymentStatus::parse(&r.status)
                    .ok_or_else(|| unknown_text("payment status", &r.status))?,
                reference: r.reference,
                created_at: r.created_at,
            })
        })
        .transpose()
    }

    async fn list_adjustments(&self, client_id: Uuid) -> BillingResult<Vec<BillingAdjustment>> {
        let rows: Vec<AdjustmentRow> = sqlx::query_as(
            r#"
            SELECT id, client_id, invoice_id, payment_id, proportional_amount,
                   days_remaining, reason, resolved, created_at
            FROM billing_adjustments
            WHERE client_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| BillingAdjustment {
                id: r.id,
                client_id: r.client_id,
                invoice_id: r.invoice_id,
                payment_id: r.payment_id,
                proportional_amount: r.proportional_amount,
                days_remaining: i64::from(r.days_remaining),
                reason: r.reason,
                resolved: r.resolved,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn notification_exists(&self, dedupe_key: &str) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM notification_queue WHERE dedupe_key = $1)",
        )
        .bind(dedupe_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_notifications(&self, client_id: Uuid) -> BillingResult<Vec<NotificationEntry>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, client_id, notification_type, title, message, priority,
                   status, dedupe_key, created_at
            FROM notification_queue
            WHERE client_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NotificationEntry::try_from).collect()
    }

    async fn commit(&self, unit: UnitOfWork) -> BillingResult<()> {
        if unit.is_empty() {
            return Ok(());
        }

        let client_id = unit.client_id;
        let mut tx = self.pool.begin().await?;
        for write in unit.writes {
            // Returning early drops `tx`, which rolls the transaction back
            Self::apply(&mut tx, write).await?;
        }
        tx.commit().await?;

        tracing::debug!(client_id = %client_id, "Billing unit of work committed");
        Ok(())
    }
}
