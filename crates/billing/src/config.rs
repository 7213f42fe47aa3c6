//! Billing configuration
//!
//! Resolved once at process start and handed to the engine constructors.
//! Nothing in the engine reads the environment after this point.

use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;

use crate::error::{BillingError, BillingResult};

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(value: &str) -> BillingResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(BillingError::Config(format!("unknown APP_ENV '{other}'"))),
        }
    }
}

/// The "provider never absorbs a loss" rule, as numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactivationPolicy {
    /// Remaining days at or below this are gifted instead of billed
    pub auto_gift_days_limit: i64,
    /// Floor on the number of days a prorated reactivation charges for
    pub minimum_chargeable_days: i64,
    /// Divisor turning a monthly fee into a daily rate
    pub days_per_month_basis: u32,
}

impl Default for ReactivationPolicy {
    fn default() -> Self {
        Self {
            auto_gift_days_limit: 2,
            minimum_chargeable_days: 3,
            days_per_month_basis: 30,
        }
    }
}

impl ReactivationPolicy {
    pub fn validate(&self) -> BillingResult<()> {
        if self.auto_gift_days_limit < 0 {
            return Err(BillingError::InvalidPolicy(
                "auto_gift_days_limit must not be negative".to_string(),
            ));
        }
        if self.minimum_chargeable_days <= self.auto_gift_days_limit {
            return Err(BillingError::InvalidPolicy(format!(
                "minimum_chargeable_days ({}) must exceed auto_gift_days_limit ({})",
                self.minimum_chargeable_days, self.auto_gift_days_limit
            )));
        }
        if self.days_per_month_basis == 0 {
            return Err(BillingError::InvalidPolicy(
                "days_per_month_basis must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Remote network access gateway settings
#[derive(Debug, Clone)]
pub struct RemoteAccessConfig {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub timeout: Duration,
    /// Skip remote calls entirely and only update local billing state
    pub skip: bool,
}

impl Default for RemoteAccessConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            timeout: Duration::from_secs(10),
            skip: true,
        }
    }
}

/// One time-of-day trigger
#[derive(Debug, Clone, PartialEq)]
pub struct JobTrigger {
    pub enabled: bool,
    pub time_of_day: NaiveTime,
    pub timezone: Tz,
}

impl JobTrigger {
    fn at(hour: u32, minute: u32) -> Self {
        Self {
            enabled: true,
            time_of_day: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default(),
            timezone: Tz::UTC,
        }
    }

    /// Six-field cron expression (sec min hour dom month dow) firing once a day
    pub fn cron_expression(&self) -> String {
        format!(
            "0 {} {} * * *",
            self.time_of_day.minute(),
            self.time_of_day.hour()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub daily_reconciliation: JobTrigger,
    pub invoice_generation: JobTrigger,
    pub reminders: JobTrigger,
    pub suspension_check: JobTrigger,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_reconciliation: JobTrigger::at(1, 0),
            invoice_generation: JobTrigger::at(6, 0),
            reminders: JobTrigger::at(9, 0),
            suspension_check: JobTrigger::at(0, 30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub environment: Environment,
    pub policy: ReactivationPolicy,
    /// Pre-generate invoices due within this many days
    pub invoice_lookahead_days: u32,
    /// Remind clients due within this many days
    pub reminder_window_days: u32,
    /// Periods the recovery step may walk forward per client per run
    pub max_recovery_periods: u32,
    pub invoice_number_prefix: String,
    /// Flat multiplier: total = amount * (1 + tax_rate)
    pub tax_rate: Decimal,
    /// Timezone used to decide what "today" is
    pub timezone: Tz,
    pub remote: RemoteAccessConfig,
    pub schedule: ScheduleConfig,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            policy: ReactivationPolicy::default(),
            invoice_lookahead_days: 5,
            reminder_window_days: 3,
            max_recovery_periods: 12,
            invoice_number_prefix: "INV".to_string(),
            tax_rate: Decimal::ZERO,
            timezone: Tz::UTC,
            remote: RemoteAccessConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl BillingConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let environment = match lookup("APP_ENV") {
            Some(v) => Environment::parse(&v)?,
            None => defaults.environment,
        };

        let policy = ReactivationPolicy {
            auto_gift_days_limit: parse_or(
                &lookup,
                "BILLING_AUTO_GIFT_DAYS_LIMIT",
                defaults.policy.auto_gift_days_limit,
            )?,
            minimum_chargeable_days: parse_or(
                &lookup,
                "BILLING_MINIMUM_CHARGEABLE_DAYS",
                defaults.policy.minimum_chargeable_days,
            )?,
            days_per_month_basis: parse_or(
                &lookup,
                "BILLING_DAYS_PER_MONTH_BASIS",
                defaults.policy.days_per_month_basis,
            )?,
        };
        policy.validate()?;

        let timezone = match lookup("BILLING_TIMEZONE") {
            Some(v) => parse_timezone(&v)?,
            None => defaults.timezone,
        };

        // Development never touches real network equipment unless asked to
        let skip_default = environment == Environment::Development;
        let remote = RemoteAccessConfig {
            base_url: lookup("ACCESS_GATEWAY_URL").filter(|v| !v.is_empty()),
            api_token: lookup("ACCESS_GATEWAY_TOKEN").filter(|v| !v.is_empty()),
            timeout: Duration::from_secs(parse_or(&lookup, "ACCESS_GATEWAY_TIMEOUT_SECS", 10)?),
            skip: parse_or(&lookup, "SKIP_REMOTE_ACTIONS", skip_default)?,
        };
        if !remote.skip && remote.base_url.is_none() {
            return Err(BillingError::Config(
                "ACCESS_GATEWAY_URL is required when remote actions are enabled".to_string(),
            ));
        }

        let schedule = ScheduleConfig {
            daily_reconciliation: parse_trigger(
                &lookup,
                "DAILY_RECONCILIATION",
                &defaults.schedule.daily_reconciliation,
                timezone,
            )?,
            invoice_generation: parse_trigger(
                &lookup,
                "INVOICE_GENERATION",
                &defaults.schedule.invoice_generation,
                timezone,
            )?,
            reminders: parse_trigger(&lookup, "REMINDERS", &defaults.schedule.reminders, timezone)?,
            suspension_check: parse_trigger(
                &lookup,
                "SUSPENSION_CHECK",
                &defaults.schedule.suspension_check,
                timezone,
            )?,
        };

        let tax_rate: Decimal = parse_or(&lookup, "BILLING_TAX_RATE", defaults.tax_rate)?;
        if tax_rate.is_sign_negative() {
            return Err(BillingError::Config(
                "BILLING_TAX_RATE must not be negative".to_string(),
            ));
        }

        Ok(Self {
            environment,
            policy,
            invoice_lookahead_days: parse_or(
                &lookup,
                "BILLING_INVOICE_LOOKAHEAD_DAYS",
                defaults.invoice_lookahead_days,
            )?,
            reminder_window_days: parse_or(
                &lookup,
                "BILLING_REMINDER_WINDOW_DAYS",
                defaults.reminder_window_days,
            )?,
            max_recovery_periods: parse_or(
                &lookup,
                "BILLING_MAX_RECOVERY_PERIODS",
                defaults.max_recovery_periods,
            )?,
            invoice_number_prefix: lookup("BILLING_INVOICE_PREFIX")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.invoice_number_prefix),
            tax_rate,
            timezone,
            remote,
            schedule,
        })
    }

    /// Current calendar date in the billing timezone
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.timezone).date_naive()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> BillingResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| BillingError::Config(format!("{key} has invalid value '{raw}'"))),
        _ => Ok(default),
    }
}

fn parse_timezone(value: &str) -> BillingResult<Tz> {
    value
        .parse::<Tz>()
        .map_err(|_| BillingError::Config(format!("unknown timezone '{value}'")))
}

/// Reads `{PREFIX}_ENABLED`, `{PREFIX}_TIME` (HH:MM) and `{PREFIX}_TIMEZONE`
fn parse_trigger<F>(
    lookup: &F,
    prefix: &str,
    default: &JobTrigger,
    fallback_tz: Tz,
) -> BillingResult<JobTrigger>
where
    F: Fn(&str) -> Option<String>,
{
    let enabled = parse_or(lookup, &format!("{prefix}_ENABLED"), default.enabled)?;
    let time_of_day = match lookup(&format!("{prefix}_TIME")) {
        Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| {
            BillingError::Config(format!("{prefix}_TIME must be HH:MM, got '{raw}'"))
        })?,
        None => default.time_of_day,
    };
    let timezone = match lookup(&format!("{prefix}_TIMEZONE")) {
        Some(raw) => parse_timezone(raw.trim())?,
        None => fallback_tz,
    };
    Ok(JobTrigger {
        enabled,
        time_of_day,
        timezone,
    })
}
