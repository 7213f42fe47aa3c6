//! Billing period arithmetic
//!
//! A client's billing period is anchored on a day of the month (the billing
//! day). Months shorter than the billing day clamp it to their last day, so a
//! billing day of 31 starts on Feb 28 (Feb 29 in leap years), Apr 30, and so on.
//!
//! Every period is inclusive on both ends and `end` is always the day before the
//! following period's `start`. Nothing here touches storage.

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Highest billing day the calculator accepts. Profiles are created with 1-28,
/// but imported data may carry 29-31 and is clamped per month.
pub const MAX_BILLING_DAY: u32 = 31;

/// An inclusive date range covered by one invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    /// Number of calendar days in the period
    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Whole days left in the period after `date`, floored at zero.
    ///
    /// A payment on the last day of the period leaves zero days.
    pub fn days_remaining(&self, date: NaiveDate) -> i64 {
        (self.end - date).num_days().max(0)
    }

    /// The period immediately after this one
    pub fn following(&self, billing_day: u32) -> BillingResult<Period> {
        let next_start = self
            .end
            .checked_add_days(Days::new(1))
            .ok_or_else(|| BillingError::DateOutOfRange(format!("no day after {}", self.end)))?;
        period_for(billing_day, next_start)
    }

    /// The period immediately before this one
    pub fn preceding(&self, billing_day: u32) -> BillingResult<Period> {
        let prev_end = self
            .start
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| BillingError::DateOutOfRange(format!("no day before {}", self.start)))?;
        period_for(billing_day, prev_end)
    }

    /// Due date for this period under the prepaid model: `start + grace_days`
    pub fn due_date(&self, grace_days: u32) -> BillingResult<NaiveDate> {
        add_days(self.start, grace_days)
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

pub fn validate_billing_day(billing_day: u32) -> BillingResult<()> {
    if (1..=MAX_BILLING_DAY).contains(&billing_day) {
        Ok(())
    } else {
        Err(BillingError::InvalidBillingDay(billing_day))
    }
}

/// Last calendar day of a month. Leap-aware: February 2028 returns 29.
pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// `date + days`, failing past the end of the calendar
pub fn add_days(date: NaiveDate, days: u32) -> BillingResult<NaiveDate> {
    date.checked_add_days(Days::new(u64::from(days)))
        .ok_or_else(|| BillingError::DateOutOfRange(format!("{date} + {days} days")))
}

/// `date - days`, failing before the start of the calendar
pub fn sub_days(date: NaiveDate, days: u32) -> BillingResult<NaiveDate> {
    date.checked_sub_days(Days::new(u64::from(days)))
        .ok_or_else(|| BillingError::DateOutOfRange(format!("{date} - {days} days")))
}

/// The billing day clamped to the month's length
pub fn adjusted_day(year: i32, month: u32, billing_day: u32) -> u32 {
    billing_day.min(last_day_of_month(year, month))
}

fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + (month as i32 - 1) + delta;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

fn anchor(year: i32, month: u32, billing_day: u32) -> BillingResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, adjusted_day(year, month, billing_day)).ok_or_else(|| {
        BillingError::DateOutOfRange(format!(
            "cannot anchor billing day {billing_day} in {year}-{month:02}"
        ))
    })
}

/// Compute the period containing `reference` for a client billed on `billing_day`.
///
/// A reference date equal to the (adjusted) billing day belongs to the period
/// starting that day.
pub fn period_for(billing_day: u32, reference: NaiveDate) -> BillingResult<Period> {
    validate_billing_day(billing_day)?;

    let (year, month) = (reference.year(), reference.month());
    let this_anchor = anchor(year, month, billing_day)?;

    let (start, next_start) = if reference >= this_anchor {
        let (ny, nm) = shift_month(year, month, 1);
        (this_anchor, anchor(ny, nm, billing_day)?)
    } else {
        let (py, pm) = shift_month(year, month, -1);
        (anchor(py, pm, billing_day)?, this_anchor)
    };

    let end = next_start
        .pred_opt()
        .ok_or_else(|| BillingError::DateOutOfRange(format!("no day before {next_start}")))?;

    Ok(Period { start, end })
}
