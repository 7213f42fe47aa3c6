// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Cycle
//!
//! Boundary conditions and end-to-end scenarios for:
//! - Period boundaries around short and leap months
//! - Invoice idempotence and superseding
//! - Late-payment gift/prorated decision and its consequences
//! - Daily reconciliation no-op, idempotence and failure isolation

#[cfg(test)]
mod support {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::models::*;
    use crate::period::Period;
    use crate::store::InMemoryBillingStore;
    use crate::suspension::{
        NetworkSuspensionCoordinator, NoopAccessController, SuspensionCoordinator,
        SuspensionOutcome,
    };
    use crate::{BillingConfig, BillingEngine, BillingError, BillingResult};

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Counts calls on the way to the real coordinator
    pub struct RecordingCoordinator {
        inner: NetworkSuspensionCoordinator,
        pub suspensions: AtomicUsize,
        pub reactivations: AtomicUsize,
        /// Make `reactivate` fail without touching anything
        pub fail_reactivations: AtomicBool,
    }

    #[async_trait]
    impl SuspensionCoordinator for RecordingCoordinator {
        async fn suspend(&self, client_id: Uuid, reason: &str) -> BillingResult<SuspensionOutcome> {
            self.suspensions.fetch_add(1, Ordering::SeqCst);
            self.inner.suspend(client_id, reason).await
        }

        async fn reactivate(
            &self,
            client_id: Uuid,
            payment_id: Uuid,
        ) -> BillingResult<SuspensionOutcome> {
            self.reactivations.fetch_add(1, Ordering::SeqCst);
            if self.fail_reactivations.load(Ordering::SeqCst) {
                return Err(BillingError::Store("status write failed".into()));
            }
            self.inner.reactivate(client_id, payment_id).await
        }
    }

    pub struct Harness {
        pub store: Arc<InMemoryBillingStore>,
        pub engine: BillingEngine,
        pub coordinator: Arc<RecordingCoordinator>,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = Arc::new(InMemoryBillingStore::new());
            let coordinator = Arc::new(RecordingCoordinator {
                inner: NetworkSuspensionCoordinator::new(
                    store.clone(),
                    Arc::new(NoopAccessController),
                    Duration::from_secs(1),
                ),
                suspensions: AtomicUsize::new(0),
                reactivations: AtomicUsize::new(0),
                fail_reactivations: AtomicBool::new(false),
            });
            let engine =
                BillingEngine::with_coordinator(BillingConfig::default(), store.clone(), coordinator.clone());
            Self {
                store,
                engine,
                coordinator,
            }
        }

        /// Active client with a billable subscription and a 300.00 monthly fee
        pub async fn client(
            &self,
            billing_day: u32,
            grace_days: u32,
            status: ClientStatus,
            next_due_date: NaiveDate,
        ) -> Uuid {
            let client_id = Uuid::new_v4();
            self.store
                .insert_client(Client {
                    id: client_id,
                    name: "Subscriber".to_string(),
                    is_active: true,
                })
                .await;
            self.store
                .insert_profile(BillingProfile {
                    client_id,
                    billing_day,
                    monthly_fee: Decimal::new(300, 0),
                    grace_days,
                    next_due_date,
                    client_status: status,
                    service_end_date: None,
                    updated_at: OffsetDateTime::now_utc(),
                })
                .await;
            self.store
                .insert_subscription(Subscription {
                    id: Uuid::new_v4(),
                    client_id,
                    service_package: "fiber-50".to_string(),
                    package_active: true,
                    status: SubscriptionStatus::Active,
                })
                .await;
            client_id
        }

        pub async fn invoice(
            &self,
            client_id: Uuid,
            period: Period,
            grace_days: u32,
            status: InvoiceStatus,
        ) -> Invoice {
            let invoice = Invoice {
                id: Uuid::new_v4(),
                client_id,
                subscription_id: Uuid::new_v4(),
                invoice_number: format!("SEED-{}", Uuid::new_v4().simple()),
                billing_period_start: period.start,
                billing_period_end: period.end,
                amount: Decimal::new(300, 0),
                total_amount: Decimal::new(300, 0),
                due_date: period.due_date(grace_days).unwrap(),
                status,
                superseded_by: None,
                cancellation_reason: None,
                created_at: OffsetDateTime::now_utc(),
                updated_at: OffsetDateTime::now_utc(),
            };
            self.store.insert_invoice(invoice.clone()).await;
            invoice
        }

        pub fn reactivations(&self) -> usize {
            self.coordinator.reactivations.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod period_tests {
    use super::support::date;
    use crate::period::*;

    // =========================================================================
    // Billing days past the end of February clamp to its last day
    // =========================================================================
    #[test]
    fn test_february_clamp_common_years() {
        for year in [2025, 2026, 2027, 2029, 2100] {
            for day in 29..=31 {
                assert_eq!(adjusted_day(year, 2, day), 28, "year {year} day {day}");
            }
        }
    }

    // =========================================================================
    // Leap years clamp to the 29th (last_day_of_month is leap-aware)
    // =========================================================================
    #[test]
    fn test_february_clamp_leap_years() {
        for year in [2024, 2028, 2000] {
            assert_eq!(adjusted_day(year, 2, 29), 29);
            assert_eq!(adjusted_day(year, 2, 30), 29);
        }
    }

    // =========================================================================
    // Billing day 30 walks through February and back without drifting
    // =========================================================================
    #[test]
    fn test_day_30_through_february() {
        let jan = period_for(30, date(2027, 1, 30)).unwrap();
        assert_eq!(jan.end, date(2027, 2, 27));

        let feb = jan.following(30).unwrap();
        assert_eq!(feb.start, date(2027, 2, 28));
        assert_eq!(feb.end, date(2027, 3, 29));

        let mar = feb.following(30).unwrap();
        assert_eq!(mar.start, date(2027, 3, 30));
    }

    // =========================================================================
    // The adjusted billing day itself opens the new period
    // =========================================================================
    #[test]
    fn test_reference_on_adjusted_day() {
        let p = period_for(31, date(2026, 6, 30)).unwrap();
        assert_eq!(p.start, date(2026, 6, 30));
        let p = period_for(31, date(2026, 6, 29)).unwrap();
        assert_eq!(p.start, date(2026, 5, 31));
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::support::*;
    use crate::models::*;
    use crate::period::period_for;
    use crate::pipeline::PipelineStep;
    use crate::store::BillingStore;

    // =========================================================================
    // Creating through the guarded path twice yields one live invoice
    // =========================================================================
    #[tokio::test]
    async fn test_backfill_twice_creates_one_invoice() {
        let h = Harness::new();
        let today = date(2026, 10, 2);
        let client_id = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;

        let first = h.engine.pipeline.run_step(PipelineStep::BackfillCurrent, today).await;
        let second = h.engine.pipeline.run_step(PipelineStep::BackfillCurrent, today).await;
        assert_eq!(first.created, 1);
        assert_eq!(second.created, 0);

        let live: Vec<Invoice> = h
            .store
            .list_invoices(client_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.status != InvoiceStatus::Cancelled)
            .collect();
        assert_eq!(live.len(), 1);
    }

    // =========================================================================
    // The store refuses a second live invoice for the same period
    // =========================================================================
    #[tokio::test]
    async fn test_store_rejects_duplicate_period() {
        let h = Harness::new();
        let today = date(2026, 10, 2);
        let client_id = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        let period = period_for(1, today).unwrap();

        h.engine
            .invoices
            .create_invoice_for_profile(&profile, &period, today)
            .await
            .unwrap();
        let again = h
            .engine
            .invoices
            .create_invoice_for_profile(&profile, &period, today)
            .await;
        assert!(again.is_err());
        assert_eq!(h.store.list_invoices(client_id).await.unwrap().len(), 1);
    }

    // =========================================================================
    // A billing-day change supersedes the still-pending earlier invoice
    // =========================================================================
    #[tokio::test]
    async fn test_superseded_invoice_is_cancelled_not_deleted() {
        let h = Harness::new();
        let today = date(2026, 10, 2);
        let client_id = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;
        let old = h
            .invoice(client_id, period_for(1, today).unwrap(), 5, InvoiceStatus::Pending)
            .await;

        let mut moved = h.store.get_profile(client_id).await.unwrap().unwrap();
        moved.billing_day = 15;
        h.store.insert_profile(moved.clone()).await;
        let new_period = period_for(15, date(2026, 10, 15)).unwrap();

        let new = h
            .engine
            .invoices
            .create_invoice_for_profile(&moved, &new_period, today)
            .await
            .unwrap()
            .unwrap();

        let stored_old = h.store.get_invoice(old.id).await.unwrap().unwrap();
        assert_eq!(stored_old.status, InvoiceStatus::Cancelled);
        assert_eq!(stored_old.superseded_by.as_deref(), Some(new.invoice_number.as_str()));
        assert!(stored_old.cancellation_reason.is_some());
        assert_eq!(h.store.list_invoices(client_id).await.unwrap().len(), 2);
    }

    // =========================================================================
    // Paid invoices are never superseded
    // =========================================================================
    #[tokio::test]
    async fn test_paid_invoice_is_not_superseded() {
        let h = Harness::new();
        let today = date(2026, 10, 2);
        let client_id = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;
        let old = h
            .invoice(client_id, period_for(1, today).unwrap(), 5, InvoiceStatus::Paid)
            .await;
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        let next = period_for(1, date(2026, 11, 1)).unwrap();

        h.engine
            .invoices
            .create_invoice_for_profile(&profile, &next, today)
            .await
            .unwrap();
        let stored_old = h.store.get_invoice(old.id).await.unwrap().unwrap();
        assert_eq!(stored_old.status, InvoiceStatus::Paid);
    }
}

#[cfg(test)]
mod reactivation_tests {
    use super::support::*;
    use crate::error::BillingError;
    use crate::models::*;
    use crate::period::period_for;
    use crate::reactivation::{LatePaymentRequest, ReactivationStrategy};
    use crate::store::BillingStore;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn payment(client_id: Uuid, on: NaiveDate) -> LatePaymentRequest {
        LatePaymentRequest {
            client_id,
            amount: Decimal::new(300, 0),
            payment_date: on,
            payment_id: None,
            reference: Some("cash desk".to_string()),
        }
    }

    /// Suspended client billed on the 1st with 5 grace days and an unpaid September
    async fn suspended_in_september(h: &Harness) -> (Uuid, Invoice) {
        let client_id = h
            .client(1, 5, ClientStatus::Suspended, date(2026, 10, 6))
            .await;
        let september = h
            .invoice(
                client_id,
                period_for(1, date(2026, 9, 1)).unwrap(),
                5,
                InvoiceStatus::Pending,
            )
            .await;
        (client_id, september)
    }

    // =========================================================================
    // Payment on day 29 of a 30-day period: one day left, gifted
    // =========================================================================
    #[tokio::test]
    async fn test_day_29_payment_gifts_remaining_day() {
        let h = Harness::new();
        let (client_id, september) = suspended_in_september(&h).await;
        let paid_on = date(2026, 9, 29);

        let outcome = h
            .engine
            .reactivation
            .process(payment(client_id, paid_on), paid_on)
            .await
            .unwrap();

        assert_eq!(outcome.days_remaining, 1);
        assert_eq!(outcome.strategy, ReactivationStrategy::Gift);
        assert!(!outcome.requires_manual_adjustment);
        assert_eq!(outcome.proportional_amount, None);
        assert_eq!(outcome.service_end_date, date(2026, 10, 31));

        let current = h.store.get_invoice(september.id).await.unwrap().unwrap();
        assert_eq!(current.status, InvoiceStatus::LostRevenue);

        let next = h
            .store
            .get_invoice(outcome.applied_invoice_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.billing_period_start, date(2026, 10, 1));
        assert_eq!(next.billing_period_end, date(2026, 10, 31));
        assert_eq!(next.status, InvoiceStatus::Paid);

        let stored_payment = h.store.get_payment(outcome.payment_id).await.unwrap().unwrap();
        assert_eq!(stored_payment.invoice_id, Some(next.id));

        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Active);
        assert_eq!(profile.service_end_date, Some(date(2026, 10, 31)));
        assert!(h.store.list_adjustments(client_id).await.unwrap().is_empty());
        assert_eq!(h.reactivations(), 1);
    }

    // =========================================================================
    // Payment on day 10: twenty days left, prorated with an adjustment
    // =========================================================================
    #[tokio::test]
    async fn test_day_10_payment_is_prorated() {
        let h = Harness::new();
        let (client_id, september) = suspended_in_september(&h).await;
        let paid_on = date(2026, 9, 10);

        let outcome = h
            .engine
            .reactivation
            .process(payment(client_id, paid_on), paid_on)
            .await
            .unwrap();

        assert_eq!(outcome.days_remaining, 20);
        assert_eq!(outcome.strategy, ReactivationStrategy::Prorated);
        assert!(outcome.requires_manual_adjustment);
        // (300 / 30) * 20
        assert_eq!(outcome.proportional_amount, Some(Decimal::new(200, 0)));
        assert_eq!(outcome.service_end_date, date(2026, 10, 5));
        assert_eq!(outcome.applied_invoice_id, september.id);

        let current = h.store.get_invoice(september.id).await.unwrap().unwrap();
        assert_eq!(current.status, InvoiceStatus::Paid);

        let stored_payment = h.store.get_payment(outcome.payment_id).await.unwrap().unwrap();
        assert_eq!(stored_payment.invoice_id, Some(september.id));

        let adjustments = h.store.list_adjustments(client_id).await.unwrap();
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].proportional_amount, Decimal::new(200, 0));
        assert!(!adjustments[0].resolved);

        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Active);
        assert_eq!(h.reactivations(), 1);
    }

    // =========================================================================
    // Off-by-one: exactly the gift limit is a gift, one more day is prorated
    // =========================================================================
    #[tokio::test]
    async fn test_gift_limit_boundary() {
        let h = Harness::new();
        let (at_limit, _) = suspended_in_september(&h).await;
        let (over_limit, _) = suspended_in_september(&h).await;

        // September ends on the 30th: the 28th leaves 2 days, the 27th leaves 3
        let gift = h
            .engine
            .reactivation
            .process(payment(at_limit, date(2026, 9, 28)), date(2026, 9, 28))
            .await
            .unwrap();
        let prorated = h
            .engine
            .reactivation
            .process(payment(over_limit, date(2026, 9, 27)), date(2026, 9, 27))
            .await
            .unwrap();

        assert_eq!(gift.days_remaining, 2);
        assert_eq!(gift.strategy, ReactivationStrategy::Gift);
        assert_eq!(prorated.days_remaining, 3);
        assert_eq!(prorated.strategy, ReactivationStrategy::Prorated);
        assert_eq!(h.reactivations(), 2);
    }

    // =========================================================================
    // Last day of the period: zero days left, never negative
    // =========================================================================
    #[tokio::test]
    async fn test_payment_on_period_end_has_zero_days() {
        let h = Harness::new();
        let (client_id, _) = suspended_in_september(&h).await;
        let outcome = h
            .engine
            .reactivation
            .process(payment(client_id, date(2026, 9, 30)), date(2026, 9, 30))
            .await
            .unwrap();
        assert_eq!(outcome.days_remaining, 0);
        assert_eq!(outcome.strategy, ReactivationStrategy::Gift);
    }

    // =========================================================================
    // Missing current invoice is created inside the same settlement
    // =========================================================================
    #[tokio::test]
    async fn test_missing_current_invoice_is_created() {
        let h = Harness::new();
        let client_id = h
            .client(1, 5, ClientStatus::Suspended, date(2026, 9, 6))
            .await;
        let paid_on = date(2026, 9, 12);

        let outcome = h
            .engine
            .reactivation
            .process(payment(client_id, paid_on), paid_on)
            .await
            .unwrap();

        let current = h
            .store
            .get_invoice(outcome.current_invoice_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.billing_period_start, date(2026, 9, 1));
        assert_eq!(current.status, InvoiceStatus::Paid);
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.next_due_date, date(2026, 10, 6));
    }

    // =========================================================================
    // A partial payment leaves the redirected invoice partially paid
    // =========================================================================
    #[tokio::test]
    async fn test_partial_gift_payment() {
        let h = Harness::new();
        let (client_id, _) = suspended_in_september(&h).await;
        let mut request = payment(client_id, date(2026, 9, 29));
        request.amount = Decimal::new(150, 0);

        let outcome = h
            .engine
            .reactivation
            .process(request, date(2026, 9, 29))
            .await
            .unwrap();
        assert_eq!(outcome.applied_invoice_status, InvoiceStatus::PartialPaid);
    }

    // =========================================================================
    // Rejections are explicit and write nothing
    // =========================================================================
    #[tokio::test]
    async fn test_rejections_write_nothing() {
        let h = Harness::new();
        let today = date(2026, 9, 10);

        let err = h
            .engine
            .reactivation
            .process(payment(Uuid::new_v4(), today), today)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ClientNotFound(_)));

        // Active and nothing overdue
        let on_time = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;
        let err = h
            .engine
            .reactivation
            .process(payment(on_time, today), today)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentNotLate(_)));

        let mut zero = payment(on_time, today);
        zero.amount = Decimal::ZERO;
        let err = h.engine.reactivation.process(zero, today).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount(_)));

        assert_eq!(h.store.commit_count(), 0);
        assert_eq!(h.reactivations(), 0);
    }

    // =========================================================================
    // A failed settlement commit leaves state untouched and skips reactivation
    // =========================================================================
    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let h = Harness::new();
        let (client_id, september) = suspended_in_september(&h).await;
        h.store.fail_commits_for(client_id).await;

        let result = h
            .engine
            .reactivation
            .process(payment(client_id, date(2026, 9, 10)), date(2026, 9, 10))
            .await;
        assert!(matches!(result, Err(BillingError::Store(_))));

        let current = h.store.get_invoice(september.id).await.unwrap().unwrap();
        assert_eq!(current.status, InvoiceStatus::Pending);
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Suspended);
        assert_eq!(h.reactivations(), 0);
    }

    // =========================================================================
    // A failing coordinator after settlement: the payment still succeeds
    // =========================================================================
    #[tokio::test]
    async fn test_coordinator_failure_after_settlement_is_not_reported_as_rejection() {
        use std::sync::atomic::Ordering;

        let h = Harness::new();
        let (client_id, september) = suspended_in_september(&h).await;
        h.coordinator.fail_reactivations.store(true, Ordering::SeqCst);
        let paid_on = date(2026, 9, 10);

        let outcome = h
            .engine
            .reactivation
            .process(payment(client_id, paid_on), paid_on)
            .await
            .unwrap();
        assert_eq!(outcome.strategy, ReactivationStrategy::Prorated);
        assert!(!outcome.remote_action_applied);
        assert_eq!(h.reactivations(), 1);

        // Settlement and status flip landed together
        let current = h.store.get_invoice(september.id).await.unwrap().unwrap();
        assert_eq!(current.status, InvoiceStatus::Paid);
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Active);
        assert_eq!(profile.service_end_date, Some(date(2026, 10, 5)));
        assert_eq!(h.store.list_adjustments(client_id).await.unwrap().len(), 1);

        // Repeating the same request is rejected without recording a second payment
        let commits = h.store.commit_count();
        let err = h
            .engine
            .reactivation
            .process(payment(client_id, paid_on), paid_on)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentNotLate(_)));
        assert_eq!(h.store.commit_count(), commits);
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::support::*;
    use crate::models::*;
    use crate::period::period_for;
    use crate::pipeline::PipelineStep;
    use crate::store::BillingStore;
    use uuid::Uuid;

    async fn snapshot(h: &Harness, clients: &[Uuid]) -> Vec<(BillingProfile, Vec<Invoice>, usize)> {
        let mut out = Vec::new();
        for id in clients {
            out.push((
                h.store.get_profile(*id).await.unwrap().unwrap(),
                h.store.list_invoices(*id).await.unwrap(),
                h.store.list_notifications(*id).await.unwrap().len(),
            ));
        }
        out
    }

    // =========================================================================
    // No eligible clients: no writes, no errors
    // =========================================================================
    #[tokio::test]
    async fn test_empty_run_is_a_no_op() {
        let h = Harness::new();
        h.client(1, 5, ClientStatus::Cancelled, date(2026, 8, 6)).await;
        h.client(1, 5, ClientStatus::Paused, date(2026, 8, 6)).await;

        let report = h.engine.pipeline.run_daily(date(2026, 10, 12)).await;
        assert_eq!(report.total_writes(), 0);
        assert_eq!(report.total_errors(), 0);
        assert_eq!(report.steps.len(), 5);
        assert_eq!(h.store.commit_count(), 0);
    }

    // =========================================================================
    // Two runs on the same day end in the same state as one
    // =========================================================================
    #[tokio::test]
    async fn test_second_run_same_day_changes_nothing() {
        let h = Harness::new();
        let today = date(2026, 10, 12);
        let clients = vec![
            // Current period never invoiced, already past its due date
            h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await,
            // Lagging three months while suspended
            h.client(1, 5, ClientStatus::Suspended, date(2026, 7, 6)).await,
            // Due within the reminder window
            h.client(9, 5, ClientStatus::Active, date(2026, 10, 14)).await,
            // Next period due within the look-ahead window
            h.client(15, 0, ClientStatus::Active, date(2026, 10, 15)).await,
        ];

        let first = h.engine.pipeline.run_daily(today).await;
        assert_eq!(first.total_errors(), 0);
        assert!(first.total_writes() > 0);
        let after_first = snapshot(&h, &clients).await;
        let commits = h.store.commit_count();

        let second = h.engine.pipeline.run_daily(today).await;
        assert_eq!(second.total_writes(), 0);
        assert_eq!(second.total_errors(), 0);
        assert_eq!(h.store.commit_count(), commits);
        assert_eq!(snapshot(&h, &clients).await, after_first);
    }

    // =========================================================================
    // Recovery walks a lagging cursor forward one period at a time
    // =========================================================================
    #[tokio::test]
    async fn test_recovers_every_missed_period() {
        let h = Harness::new();
        let today = date(2026, 10, 12);
        let client_id = h
            .client(1, 5, ClientStatus::Suspended, date(2026, 7, 6))
            .await;

        let report = h.engine.pipeline.run_step(PipelineStep::RecoverMissed, today).await;
        assert_eq!(report.recovered, 4);

        let starts: Vec<_> = h
            .store
            .list_invoices(client_id)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.billing_period_start)
            .collect();
        assert_eq!(
            starts,
            vec![date(2026, 7, 1), date(2026, 8, 1), date(2026, 9, 1), date(2026, 10, 1)]
        );
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.next_due_date, date(2026, 11, 6));
    }

    // =========================================================================
    // Recovery stops at the per-run limit and resumes on the next run
    // =========================================================================
    #[tokio::test]
    async fn test_recovery_limit_resumes_next_run() {
        let h = Harness::new();
        let today = date(2026, 10, 12);
        let client_id = h
            .client(1, 5, ClientStatus::Suspended, date(2024, 1, 6))
            .await;

        let first = h.engine.pipeline.run_step(PipelineStep::RecoverMissed, today).await;
        assert_eq!(first.recovered, 12);
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.next_due_date, date(2025, 1, 6));

        let second = h.engine.pipeline.run_step(PipelineStep::RecoverMissed, today).await;
        assert_eq!(second.recovered, 12);
        let third = h.engine.pipeline.run_step(PipelineStep::RecoverMissed, today).await;
        assert_eq!(third.recovered, 10);
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.next_due_date, date(2026, 11, 6));
    }

    // =========================================================================
    // Overdue active client is suspended once, with a high-priority notice
    // =========================================================================
    #[tokio::test]
    async fn test_overdue_client_is_suspended() {
        let h = Harness::new();
        let today = date(2026, 10, 12);
        let client_id = h.client(1, 5, ClientStatus::Active, date(2026, 11, 6)).await;
        h.invoice(
            client_id,
            period_for(1, date(2026, 10, 1)).unwrap(),
            5,
            InvoiceStatus::Pending,
        )
        .await;

        let report = h.engine.pipeline.run_step(PipelineStep::SuspendOverdue, today).await;
        assert_eq!(report.suspended, 1);

        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Suspended);
        let notices = h.store.list_notifications(client_id).await.unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].notification_type, NotificationType::ServiceSuspended);
        assert_eq!(notices[0].priority, NotificationPriority::High);

        let again = h.engine.pipeline.run_step(PipelineStep::SuspendOverdue, today).await;
        assert_eq!(again.suspended, 0);
    }

    // =========================================================================
    // Reminder is queued for an invoice due inside the window
    // =========================================================================
    #[tokio::test]
    async fn test_reminder_for_upcoming_due_date() {
        let h = Harness::new();
        let today = date(2026, 10, 12);
        let client_id = h.client(9, 5, ClientStatus::Active, date(2026, 10, 14)).await;

        let report = h.engine.pipeline.run_daily(today).await;
        assert_eq!(report.step(PipelineStep::BackfillCurrent).unwrap().created, 1);
        assert_eq!(report.step(PipelineStep::SuspendOverdue).unwrap().suspended, 0);
        assert_eq!(report.step(PipelineStep::RemindUpcoming).unwrap().reminded, 1);

        let notices = h.store.list_notifications(client_id).await.unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].notification_type, NotificationType::PaymentReminder);
        assert_eq!(notices[0].priority, NotificationPriority::Normal);
    }

    // =========================================================================
    // Upcoming period is invoiced ahead of time, current one left alone
    // =========================================================================
    #[tokio::test]
    async fn test_pre_generates_upcoming_invoice() {
        let h = Harness::new();
        let today = date(2026, 10, 12);
        let client_id = h.client(15, 0, ClientStatus::Active, date(2026, 10, 15)).await;
        h.invoice(
            client_id,
            period_for(15, date(2026, 9, 15)).unwrap(),
            0,
            InvoiceStatus::Paid,
        )
        .await;

        let report = h.engine.pipeline.run_daily(today).await;
        assert_eq!(report.step(PipelineStep::BackfillCurrent).unwrap().created, 0);
        assert_eq!(report.step(PipelineStep::GenerateUpcoming).unwrap().created, 1);

        let invoices = h.store.list_invoices(client_id).await.unwrap();
        assert_eq!(invoices.len(), 2);
        assert_eq!(invoices[1].billing_period_start, date(2026, 10, 15));
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.next_due_date, date(2026, 11, 15));
    }

    // =========================================================================
    // One client's write failure does not stop the others
    // =========================================================================
    #[tokio::test]
    async fn test_failed_client_is_reported_and_run_continues() {
        let h = Harness::new();
        let today = date(2026, 10, 2);
        let broken = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;
        let healthy = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;
        h.store.fail_commits_for(broken).await;

        let report = h.engine.pipeline.run_step(PipelineStep::BackfillCurrent, today).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].client_id, Some(broken));
        assert!(h.store.list_invoices(broken).await.unwrap().is_empty());
        assert_eq!(h.store.list_invoices(healthy).await.unwrap().len(), 1);
    }

    // =========================================================================
    // Inactive clients and clients without a subscription are skipped quietly
    // =========================================================================
    #[tokio::test]
    async fn test_backfill_skips_unbillable_clients() {
        let h = Harness::new();
        let today = date(2026, 10, 2);

        let inactive = h.client(1, 5, ClientStatus::Active, date(2026, 10, 6)).await;
        h.store
            .insert_client(Client {
                id: inactive,
                name: "Gone".to_string(),
                is_active: false,
            })
            .await;

        let orphan = Uuid::new_v4();
        h.store
            .insert_client(Client {
                id: orphan,
                name: "No plan".to_string(),
                is_active: true,
            })
            .await;
        let template = h.store.get_profile(inactive).await.unwrap().unwrap();
        h.store
            .insert_profile(BillingProfile {
                client_id: orphan,
                ..template
            })
            .await;

        let report = h.engine.pipeline.run_step(PipelineStep::BackfillCurrent, today).await;
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped, 2);
        assert!(report.errors.is_empty());
    }

    // =========================================================================
    // Suspension then late payment: suspended once, reactivated once
    // =========================================================================
    #[tokio::test]
    async fn test_suspend_then_reactivate_round_trip() {
        use crate::reactivation::LatePaymentRequest;
        use rust_decimal::Decimal;
        use std::sync::atomic::Ordering;

        let h = Harness::new();
        let client_id = h.client(1, 5, ClientStatus::Active, date(2026, 9, 6)).await;

        h.engine.pipeline.run_daily(date(2026, 9, 8)).await;
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Suspended);

        let outcome = h
            .engine
            .reactivation
            .process(
                LatePaymentRequest {
                    client_id,
                    amount: Decimal::new(300, 0),
                    payment_date: date(2026, 9, 10),
                    payment_id: None,
                    reference: None,
                },
                date(2026, 9, 10),
            )
            .await
            .unwrap();
        assert_eq!(outcome.days_remaining, 20);

        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Active);
        assert_eq!(h.coordinator.suspensions.load(Ordering::SeqCst), 1);
        assert_eq!(h.reactivations(), 1);

        // The paid client is not suspended again on the next run
        let report = h.engine.pipeline.run_daily(date(2026, 9, 11)).await;
        assert_eq!(report.step(PipelineStep::SuspendOverdue).unwrap().suspended, 0);
        assert!(h.engine.invariants.run_all_checks(date(2026, 9, 11)).await.unwrap().healthy);
    }

    // =========================================================================
    // Service granted by a gift reactivation survives older arrears
    // =========================================================================
    #[tokio::test]
    async fn test_gift_reactivation_is_not_undone_by_next_run() {
        use crate::reactivation::{LatePaymentRequest, ReactivationStrategy};
        use rust_decimal::Decimal;

        let h = Harness::new();
        let client_id = h
            .client(1, 5, ClientStatus::Suspended, date(2026, 10, 6))
            .await;
        let august = h
            .invoice(
                client_id,
                period_for(1, date(2026, 8, 1)).unwrap(),
                5,
                InvoiceStatus::Pending,
            )
            .await;
        h.invoice(
            client_id,
            period_for(1, date(2026, 9, 1)).unwrap(),
            5,
            InvoiceStatus::Pending,
        )
        .await;

        // Half the fee: October ends up partially paid and due on Oct 6
        let outcome = h
            .engine
            .reactivation
            .process(
                LatePaymentRequest {
                    client_id,
                    amount: Decimal::new(150, 0),
                    payment_date: date(2026, 9, 29),
                    payment_id: None,
                    reference: None,
                },
                date(2026, 9, 29),
            )
            .await
            .unwrap();
        assert_eq!(outcome.strategy, ReactivationStrategy::Gift);
        assert_eq!(outcome.applied_invoice_status, InvoiceStatus::PartialPaid);
        assert_eq!(outcome.service_end_date, date(2026, 10, 31));

        for day in [date(2026, 9, 30), date(2026, 10, 7), date(2026, 10, 31)] {
            let report = h.engine.pipeline.run_daily(day).await;
            let suspend = report.step(PipelineStep::SuspendOverdue).unwrap();
            assert_eq!(suspend.suspended, 0, "suspended on {day}");
            let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
            assert_eq!(profile.client_status, ClientStatus::Active, "status on {day}");
        }

        // Once the granted service ends the August arrears count again
        let report = h.engine.pipeline.run_daily(date(2026, 11, 1)).await;
        assert_eq!(report.step(PipelineStep::SuspendOverdue).unwrap().suspended, 1);
        let august = h.store.get_invoice(august.id).await.unwrap().unwrap();
        assert_eq!(august.status, InvoiceStatus::Pending);
        let profile = h.store.get_profile(client_id).await.unwrap().unwrap();
        assert_eq!(profile.client_status, ClientStatus::Suspended);
    }
}
