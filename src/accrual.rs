//! Earnings accrual for fixed-rate, fixed-term investment contracts.
//!
//! Returns are simple interest: `amount × daily_roi / 100` per whole elapsed
//! day, never compounded, and they stop accruing once the contract term
//! (`cycle_days`) is reached.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::ValidationError;
use crate::types::UserInvestment;

/// Number of days `project_returns` reports as the full-term total.
pub const PROJECTION_HORIZON_DAYS: u32 = 90;

/// Longest contract term accepted from the store or configuration.
pub const MAX_CYCLE_DAYS: u32 = 36_500;

/// The numbers accrual needs from an investment contract.
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualTerms {
    pub amount: Decimal,
    pub daily_roi: Decimal,
    pub created_at: DateTime<Utc>,
    pub cycle_days: Option<u32>,
}

impl AccrualTerms {
    /// Terms of `investment`, using `fallback_cycle_days` when the record does
    /// not carry its own term.
    pub fn for_investment(investment: &UserInvestment, fallback_cycle_days: Option<u32>) -> Self {
        Self {
            amount: investment.amount,
            daily_roi: investment.plan.daily_roi,
            created_at: investment.created_at,
            cycle_days: investment.cycle_days.or(fallback_cycle_days),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate_inputs(self.amount, self.daily_roi)
    }
}

/// Simple projection of returns for a principal at a daily rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnProjection {
    pub daily: Decimal,
    pub weekly: Decimal,
    pub monthly: Decimal,
    pub total: Decimal,
}

fn validate_inputs(amount: Decimal, daily_roi: Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(ValidationError::NegativeAmount(amount));
    }
    if daily_roi.is_sign_negative() && !daily_roi.is_zero() {
        return Err(ValidationError::NegativeRate(daily_roi));
    }
    Ok(())
}

/// What the principal earns in one day.
pub fn daily_earning(amount: Decimal, daily_roi: Decimal) -> Result<Decimal, ValidationError> {
    amount
        .checked_mul(daily_roi / Decimal::ONE_HUNDRED)
        .ok_or(ValidationError::Overflow)
}

fn times(value: Decimal, days: i64) -> Result<Decimal, ValidationError> {
    value
        .checked_mul(Decimal::from(days))
        .ok_or(ValidationError::Overflow)
}

/// Whole days between `created_at` and `now`, clamped at zero when `now`
/// is earlier.
pub fn elapsed_days(created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - created_at).num_days().max(0)
}

/// Amount earned by the contract as of `now`.
pub fn calculate_earnings(terms: &AccrualTerms, now: DateTime<Utc>) -> Result<Decimal, ValidationError> {
    terms.validate()?;
    let cycle_days = match terms.cycle_days {
        Some(days) if days > 0 => i64::from(days),
        _ => return Ok(Decimal::ZERO),
    };
    let days = elapsed_days(terms.created_at, now).min(cycle_days);
    times(daily_earning(terms.amount, terms.daily_roi)?, days)
}

/// Whether the contract has reached the end of its term.
///
/// A contract without a known term never completes; a zero-day term is
/// complete immediately.
pub fn is_cycle_completed(terms: &AccrualTerms, now: DateTime<Utc>) -> bool {
    match terms.cycle_days {
        Some(days) => elapsed_days(terms.created_at, now) >= i64::from(days),
        None => false,
    }
}

/// Time left until maturity, zero once matured.
///
/// `None` without a known term, or when the maturity date is past the
/// representable range.
pub fn time_remaining(terms: &AccrualTerms, now: DateTime<Utc>) -> Option<Duration> {
    let term = Duration::try_days(i64::from(terms.cycle_days?))?;
    let matures_at = terms.created_at.checked_add_signed(term)?;
    Some((matures_at - now).max(Duration::zero()))
}

pub fn project_returns(amount: Decimal, daily_roi: Decimal) -> Result<ReturnProjection, ValidationError> {
    validate_inputs(amount, daily_roi)?;
    let daily = daily_earning(amount, daily_roi)?;
    Ok(ReturnProjection {
        daily,
        weekly: times(daily, 7)?,
        monthly: times(daily, 30)?,
        total: times(daily, i64::from(PROJECTION_HORIZON_DAYS))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap()
    }

    fn terms(cycle_days: Option<u32>) -> AccrualTerms {
        AccrualTerms {
            amount: Decimal::from(10_000),
            daily_roi: Decimal::from(4),
            created_at: start(),
            cycle_days,
        }
    }

    #[test]
    fn nothing_earned_at_start() {
        assert_eq!(calculate_earnings(&terms(Some(90)), start()), Ok(Decimal::ZERO));
    }

    #[test]
    fn earns_per_whole_day() {
        let now = start() + Duration::days(5);
        assert_eq!(calculate_earnings(&terms(Some(90)), now), Ok(Decimal::from(2000)));

        // a partial day does not count
        let now = start() + Duration::days(5) + Duration::hours(23);
        assert_eq!(calculate_earnings(&terms(Some(90)), now), Ok(Decimal::from(2000)));
    }

    #[test]
    fn earnings_cap_at_cycle_end() {
        let now = start() + Duration::days(200);
        assert_eq!(calculate_earnings(&terms(Some(90)), now), Ok(Decimal::from(36_000)));
    }

    #[test]
    fn earnings_are_monotone_then_flat() {
        let t = terms(Some(90));
        let mut previous = Decimal::ZERO;
        for day in 0..=200 {
            let earned = calculate_earnings(&t, start() + Duration::days(day)).unwrap();
            assert!(earned >= previous, "day {day} went down");
            if day >= 90 {
                assert_eq!(earned, Decimal::from(36_000));
            }
            previous = earned;
        }
    }

    #[test]
    fn clock_skew_yields_zero() {
        let now = start() - Duration::days(3);
        assert_eq!(calculate_earnings(&terms(Some(90)), now), Ok(Decimal::ZERO));
        assert_eq!(elapsed_days(start(), now), 0);
    }

    #[test]
    fn zero_or_missing_cycle_earns_nothing() {
        let now = start() + Duration::days(10);
        assert_eq!(calculate_earnings(&terms(Some(0)), now), Ok(Decimal::ZERO));
        assert_eq!(calculate_earnings(&terms(None), now), Ok(Decimal::ZERO));
    }

    #[test]
    fn negative_inputs_are_rejected() {
        let mut t = terms(Some(90));
        t.amount = Decimal::from(-1);
        assert!(matches!(
            calculate_earnings(&t, start()),
            Err(ValidationError::NegativeAmount(_))
        ));

        let mut t = terms(Some(90));
        t.daily_roi = Decimal::new(-5, 1);
        assert!(matches!(
            calculate_earnings(&t, start()),
            Err(ValidationError::NegativeRate(_))
        ));
        assert!(project_returns(Decimal::from(-5), Decimal::from(4)).is_err());
    }

    #[test]
    fn cycle_completion_uses_uncapped_days() {
        let t = terms(Some(90));
        assert!(!is_cycle_completed(&t, start() + Duration::days(89)));
        assert!(is_cycle_completed(&t, start() + Duration::days(90)));
        assert!(is_cycle_completed(&t, start() + Duration::days(400)));
        assert!(!is_cycle_completed(&terms(None), start() + Duration::days(400)));
        assert!(is_cycle_completed(&terms(Some(0)), start()));
    }

    #[test]
    fn remaining_time_never_negative() {
        let t = terms(Some(90));
        assert_eq!(
            time_remaining(&t, start() + Duration::days(80)),
            Some(Duration::days(10))
        );
        assert_eq!(
            time_remaining(&t, start() + Duration::days(120)),
            Some(Duration::zero())
        );
        assert_eq!(time_remaining(&terms(None), start()), None);
    }

    #[test]
    fn huge_amounts_overflow_instead_of_panicking() {
        assert_eq!(
            project_returns(Decimal::MAX, Decimal::from(4)),
            Err(ValidationError::Overflow)
        );
        // the daily figure fits but ninety days of it does not
        let amount = Decimal::MAX / Decimal::from(50);
        assert_eq!(project_returns(amount, Decimal::from(100)), Err(ValidationError::Overflow));

        let mut t = terms(Some(90));
        t.amount = amount;
        t.daily_roi = Decimal::from(100);
        assert_eq!(
            calculate_earnings(&t, start() + Duration::days(60)),
            Err(ValidationError::Overflow)
        );
        assert!(calculate_earnings(&t, start() + Duration::days(1)).is_ok());
    }

    #[test]
    fn unrepresentable_maturity_has_no_countdown() {
        let t = terms(Some(u32::MAX));
        assert_eq!(time_remaining(&t, start()), None);
        assert!(!is_cycle_completed(&t, start() + Duration::days(400)));
        let months = terms(Some(MAX_CYCLE_DAYS));
        assert!(time_remaining(&months, start()).is_some());
    }

    #[test]
    fn projection_is_linear() {
        let p = project_returns(Decimal::from(5000), Decimal::from(4)).unwrap();
        assert_eq!(
            p,
            ReturnProjection {
                daily: Decimal::from(200),
                weekly: Decimal::from(1400),
                monthly: Decimal::from(6000),
                total: Decimal::from(18_000),
            }
        );
    }

    #[test]
    fn fractional_rates_stay_exact() {
        // bronze plan: 0.8% per day
        let p = project_returns(Decimal::from(25_000), Decimal::new(8, 1)).unwrap();
        assert_eq!(p.daily, Decimal::from(200));
        assert_eq!(p.total, Decimal::from(18_000));
    }
}
