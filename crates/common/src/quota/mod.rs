//! Token quota accounting
//!
//! Every user has a daily and a monthly token budget determined by their plan.
//! Counters roll over on UTC day/month boundaries. Checking and reserving
//! happen under one lock, so concurrent requests can never jointly overrun
//! a budget: callers reserve an estimate up front, then settle with the
//! actual usage reported by the model.

use crate::config::QuotaConfig;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Subscription plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        };
        f.write_str(name)
    }
}

impl FromStr for Plan {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "basic" => Ok(Plan::Basic),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(AppError::Validation {
                message: format!("Unknown plan: {}", other),
                field: Some("plan".to_string()),
            }),
        }
    }
}

/// Token limits for one plan; zero means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub daily: u64,
    pub monthly: u64,
}

impl QuotaLimits {
    pub fn unlimited() -> Self {
        Self { daily: 0, monthly: 0 }
    }
}

/// Budget period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl fmt::Display for QuotaPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaPeriod::Daily => f.write_str("daily"),
            QuotaPeriod::Monthly => f.write_str("monthly"),
        }
    }
}

#[derive(Debug, Clone)]
struct UsageRecord {
    day: NaiveDate,
    month: (i32, u32),
    day_used: u64,
    month_used: u64,
    /// Tokens held by unsettled reservations
    reserved: u64,
}

impl UsageRecord {
    fn new(now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self {
            day: today,
            month: (today.year(), today.month()),
            day_used: 0,
            month_used: 0,
            reserved: 0,
        }
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let month = (today.year(), today.month());

        if month != self.month {
            self.month = month;
            self.month_used = 0;
            self.day = today;
            self.day_used = 0;
        } else if today != self.day {
            self.day = today;
            self.day_used = 0;
        }
    }

    fn check(&self, limits: QuotaLimits, tokens: u64) -> Result<()> {
        let pending = self.reserved.saturating_add(tokens);

        if limits.daily > 0 && self.day_used.saturating_add(pending) > limits.daily {
            return Err(AppError::QuotaExceeded {
                period: QuotaPeriod::Daily.to_string(),
                limit: limits.daily,
                used: self.day_used + self.reserved,
                requested: tokens,
            });
        }

        if limits.monthly > 0 && self.month_used.saturating_add(pending) > limits.monthly {
            return Err(AppError::QuotaExceeded {
                period: QuotaPeriod::Monthly.to_string(),
                limit: limits.monthly,
                used: self.month_used + self.reserved,
                requested: tokens,
            });
        }

        Ok(())
    }
}

/// Usage of one period as reported to clients
#[derive(Debug, Clone, Serialize)]
pub struct PeriodUsage {
    pub used: u64,
    pub reserved: u64,
    /// None when the plan is unlimited for this period
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub resets_at: DateTime<Utc>,
}

/// Point-in-time view of a user's quota
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub user_id: Uuid,
    pub plan: Plan,
    pub enforced: bool,
    pub daily: PeriodUsage,
    pub monthly: PeriodUsage,
}

struct QuotaInner {
    enabled: bool,
    limits: HashMap<Plan, QuotaLimits>,
    usage: Mutex<HashMap<Uuid, UsageRecord>>,
}

impl QuotaInner {
    fn limits(&self, plan: Plan) -> QuotaLimits {
        self.limits
            .get(&plan)
            .copied()
            .unwrap_or_else(QuotaLimits::unlimited)
    }
}

/// Shared quota tracker; clones share state
#[derive(Clone)]
pub struct QuotaTracker {
    inner: Arc<QuotaInner>,
}

impl QuotaTracker {
    pub fn new(enabled: bool, limits: HashMap<Plan, QuotaLimits>) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                enabled,
                limits,
                usage: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        let limits = [Plan::Free, Plan::Basic, Plan::Pro, Plan::Enterprise]
            .into_iter()
            .map(|plan| {
                let configured = config.limits_for(plan);
                (
                    plan,
                    QuotaLimits {
                        daily: configured.daily_tokens,
                        monthly: configured.monthly_tokens,
                    },
                )
            })
            .collect();

        Self::new(config.enabled, limits)
    }

    /// Reserve `tokens` against both budgets, failing if either would be exceeded
    pub fn reserve(
        &self,
        user_id: Uuid,
        plan: Plan,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<QuotaReservation> {
        let limits = self.inner.limits(plan);
        let mut usage = self.inner.usage.lock();
        let record = usage.entry(user_id).or_insert_with(|| UsageRecord::new(now));
        record.roll_over(now);

        if self.inner.enabled {
            if let Err(e) = record.check(limits, tokens) {
                crate::metrics::record_quota_rejection(&plan.to_string());
                return Err(e);
            }
        }

        record.reserved = record.reserved.saturating_add(tokens);

        Ok(QuotaReservation {
            inner: self.inner.clone(),
            user_id,
            tokens,
            settled: false,
        })
    }

    /// Charge tokens that were spent without a reservation
    pub fn record(&self, user_id: Uuid, tokens: u64, now: DateTime<Utc>) {
        let mut usage = self.inner.usage.lock();
        let record = usage.entry(user_id).or_insert_with(|| UsageRecord::new(now));
        record.roll_over(now);
        record.day_used = record.day_used.saturating_add(tokens);
        record.month_used = record.month_used.saturating_add(tokens);
    }

    /// Current usage and remaining budget for a user
    pub fn snapshot(&self, user_id: Uuid, plan: Plan, now: DateTime<Utc>) -> UsageSnapshot {
        let limits = self.inner.limits(plan);
        let record = {
            let mut usage = self.inner.usage.lock();
            match usage.get_mut(&user_id) {
                Some(record) => {
                    record.roll_over(now);
                    record.clone()
                }
                None => UsageRecord::new(now),
            }
        };

        let period = |used: u64, limit: u64, resets_at: DateTime<Utc>| {
            let limit = (limit > 0).then_some(limit);
            PeriodUsage {
                used,
                reserved: record.reserved,
                limit,
                remaining: limit.map(|l| l.saturating_sub(used + record.reserved)),
                resets_at,
            }
        };

        UsageSnapshot {
            user_id,
            plan,
            enforced: self.inner.enabled,
            daily: period(record.day_used, limits.daily, next_day_start(record.day)),
            monthly: period(record.month_used, limits.monthly, next_month_start(record.day)),
        }
    }
}

/// Tokens held against a user's budget until settled or dropped
pub struct QuotaReservation {
    inner: Arc<QuotaInner>,
    user_id: Uuid,
    tokens: u64,
    settled: bool,
}

impl QuotaReservation {
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Release the reservation and charge the actual usage
    pub fn settle(mut self, actual_tokens: u64) {
        let mut usage = self.inner.usage.lock();
        if let Some(record) = usage.get_mut(&self.user_id) {
            record.reserved = record.reserved.saturating_sub(self.tokens);
            record.day_used = record.day_used.saturating_add(actual_tokens);
            record.month_used = record.month_used.saturating_add(actual_tokens);
        }
        self.settled = true;
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut usage = self.inner.usage.lock();
        if let Some(record) = usage.get_mut(&self.user_id) {
            record.reserved = record.reserved.saturating_sub(self.tokens);
        }
    }
}

fn next_day_start(day: NaiveDate) -> DateTime<Utc> {
    (day + Days::new(1)).and_time(NaiveTime::MIN).and_utc()
}

fn next_month_start(day: NaiveDate) -> DateTime<Utc> {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or(day)
        .and_time(NaiveTime::MIN)
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker(daily: u64, monthly: u64) -> QuotaTracker {
        let mut limits = HashMap::new();
        limits.insert(Plan::Free, QuotaLimits { daily, monthly });
        limits.insert(Plan::Enterprise, QuotaLimits::unlimited());
        QuotaTracker::new(true, limits)
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_reserve_and_settle() {
        let quota = tracker(1000, 10_000);
        let user = Uuid::new_v4();
        let now = at(2026, 3, 10, 12);

        let reservation = quota.reserve(user, Plan::Free, 400, now).unwrap();
        let snap = quota.snapshot(user, Plan::Free, now);
        assert_eq!(snap.daily.reserved, 400);
        assert_eq!(snap.daily.remaining, Some(600));

        reservation.settle(250);
        let snap = quota.snapshot(user, Plan::Free, now);
        assert_eq!(snap.daily.used, 250);
        assert_eq!(snap.daily.reserved, 0);
        assert_eq!(snap.monthly.used, 250);
    }

    #[test]
    fn test_daily_limit_rejects() {
        let quota = tracker(1000, 10_000);
        let user = Uuid::new_v4();
        let now = at(2026, 3, 10, 12);

        quota.record(user, 900, now);
        let err = quota.reserve(user, Plan::Free, 200, now).err().unwrap();
        match err {
            AppError::QuotaExceeded { period, used, requested, .. } => {
                assert_eq!(period, "daily");
                assert_eq!(used, 900);
                assert_eq!(requested, 200);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(quota.reserve(user, Plan::Free, 100, now).is_ok());
    }

    #[test]
    fn test_monthly_limit_rejects() {
        let quota = tracker(0, 500);
        let user = Uuid::new_v4();
        let now = at(2026, 3, 10, 12);

        quota.record(user, 450, now);
        let err = quota.reserve(user, Plan::Free, 100, now).err().unwrap();
        assert!(matches!(err, AppError::QuotaExceeded { ref period, .. } if period == "monthly"));
    }

    #[test]
    fn test_dropped_reservation_is_released() {
        let quota = tracker(100, 0);
        let user = Uuid::new_v4();
        let now = at(2026, 3, 10, 12);

        {
            let _held = quota.reserve(user, Plan::Free, 80, now).unwrap();
            assert!(quota.reserve(user, Plan::Free, 30, now).is_err());
        }
        assert!(quota.reserve(user, Plan::Free, 30, now).is_ok());
        assert_eq!(quota.snapshot(user, Plan::Free, now).daily.used, 0);
    }

    #[test]
    fn test_day_rollover_keeps_month() {
        let quota = tracker(100, 1000);
        let user = Uuid::new_v4();

        quota.record(user, 100, at(2026, 3, 10, 23));
        assert!(quota.reserve(user, Plan::Free, 1, at(2026, 3, 10, 23)).is_err());

        let next_day = at(2026, 3, 11, 0);
        let snap = quota.snapshot(user, Plan::Free, next_day);
        assert_eq!(snap.daily.used, 0);
        assert_eq!(snap.monthly.used, 100);
        assert!(quota.reserve(user, Plan::Free, 50, next_day).is_ok());
    }

    #[test]
    fn test_month_rollover_resets_both() {
        let quota = tracker(100, 150);
        let user = Uuid::new_v4();

        quota.record(user, 150, at(2026, 12, 31, 20));
        let snap = quota.snapshot(user, Plan::Free, at(2027, 1, 1, 1));
        assert_eq!(snap.daily.used, 0);
        assert_eq!(snap.monthly.used, 0);
        assert_eq!(snap.monthly.resets_at, at(2027, 2, 1, 0));
    }

    #[test]
    fn test_unlimited_plan() {
        let quota = tracker(10, 10);
        let user = Uuid::new_v4();
        let now = at(2026, 3, 10, 12);

        let reservation = quota.reserve(user, Plan::Enterprise, 1_000_000, now).unwrap();
        reservation.settle(1_000_000);
        let snap = quota.snapshot(user, Plan::Enterprise, now);
        assert_eq!(snap.daily.limit, None);
        assert_eq!(snap.daily.remaining, None);
        assert_eq!(snap.daily.used, 1_000_000);
    }

    #[test]
    fn test_disabled_quota_still_records() {
        let mut limits = HashMap::new();
        limits.insert(Plan::Free, QuotaLimits { daily: 10, monthly: 10 });
        let quota = QuotaTracker::new(false, limits);
        let user = Uuid::new_v4();
        let now = at(2026, 3, 10, 12);

        quota.reserve(user, Plan::Free, 500, now).unwrap().settle(500);
        let snap = quota.snapshot(user, Plan::Free, now);
        assert!(!snap.enforced);
        assert_eq!(snap.daily.used, 500);
    }

    #[test]
    fn test_concurrent_reservations_never_overrun() {
        let quota = tracker(100, 0);
        let user = Uuid::new_v4();
        let now = at(2026, 3, 10, 12);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let quota = quota.clone();
                std::thread::spawn(move || quota.reserve(user, Plan::Free, 10, now).ok())
            })
            .collect();

        let held: Vec<QuotaReservation> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(held.len(), 10);
        assert_eq!(quota.snapshot(user, Plan::Free, now).daily.reserved, 100);
    }

    #[test]
    fn test_plan_parsing() {
        assert_eq!("Pro".parse::<Plan>().unwrap(), Plan::Pro);
        assert!("platinum".parse::<Plan>().is_err());
        assert_eq!(Plan::Basic.to_string(), "basic");
    }
}
