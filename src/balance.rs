//! Withdrawable balances.
//!
//! A user holds two balances. Investment returns accrue on active and
//! completed investments and are drawn by `withdrawal` requests. Referral
//! commissions come from the user's referral report and are drawn by
//! `commission_withdrawal` requests. Pending requests already count against
//! a balance; failed and rejected ones do not.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::accrual::{AccrualTerms, calculate_earnings};
use crate::error::ValidationError;
use crate::types::{InvestmentStatus, UserInvestment, Withdrawal, WithdrawalKind, WithdrawalStatus};

/// Withdrawal minimums that do not come from a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WithdrawalLimits {
    /// Applies to returns when the user holds no plan to take it from.
    pub min_withdrawal: Decimal,
    pub min_commission_withdrawal: Decimal,
}

impl Default for WithdrawalLimits {
    fn default() -> Self {
        Self {
            min_withdrawal: Decimal::from(1_000),
            min_commission_withdrawal: Decimal::from(500),
        }
    }
}

/// One of the two balances of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    /// Everything credited so far.
    pub credited: Decimal,
    /// Paid out.
    pub withdrawn: Decimal,
    /// Requested and not yet paid out.
    pub pending: Decimal,
    /// What a new request may still draw, never negative.
    pub available: Decimal,
    /// Smallest amount a single request may draw.
    pub minimum: Decimal,
}

impl Account {
    fn new(credited: Decimal, withdrawn: Decimal, pending: Decimal, minimum: Decimal) -> Result<Self, ValidationError> {
        let outstanding = withdrawn.checked_add(pending).ok_or(ValidationError::Overflow)?;
        Ok(Self {
            credited,
            withdrawn,
            pending,
            available: (credited - outstanding).max(Decimal::ZERO),
            minimum,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub returns: Account,
    pub commissions: Account,
}

impl Balance {
    pub fn account(&self, kind: WithdrawalKind) -> &Account {
        match kind {
            WithdrawalKind::Withdrawal => &self.returns,
            WithdrawalKind::CommissionWithdrawal => &self.commissions,
        }
    }
}

/// Why a withdrawal request is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WithdrawalError {
    #[error("withdrawal amount must be > 0, got {0}")]
    NonPositive(Decimal),
    #[error("the minimum withdrawal is {minimum}, got {amount}")]
    BelowMinimum { minimum: Decimal, amount: Decimal },
    #[error("only {available} is available, requested {amount}")]
    Insufficient { available: Decimal, amount: Decimal },
}

/// Returns accrued by `investments` as of `now`.
///
/// Completed investments keep what they earned over their full term.
pub fn accrued_returns(
    investments: &[UserInvestment],
    fallback_cycle_days: u32,
    now: DateTime<Utc>,
) -> Result<Decimal, ValidationError> {
    investments
        .iter()
        .filter(|i| matches!(i.status, InvestmentStatus::Active | InvestmentStatus::Completed))
        .try_fold(Decimal::ZERO, |sum, i| {
            let earned = calculate_earnings(&AccrualTerms::for_investment(i, Some(fallback_cycle_days)), now)?;
            sum.checked_add(earned).ok_or(ValidationError::Overflow)
        })
}

/// The minimum for withdrawing returns: the most permissive
/// `min_withdrawal` among the plans the user earns from.
pub fn returns_minimum(investments: &[UserInvestment], limits: &WithdrawalLimits) -> Decimal {
    investments
        .iter()
        .filter(|i| matches!(i.status, InvestmentStatus::Active | InvestmentStatus::Completed))
        .map(|i| i.plan.min_withdrawal)
        .min()
        .unwrap_or(limits.min_withdrawal)
}

fn drawn(withdrawals: &[Withdrawal], kind: WithdrawalKind, status: WithdrawalStatus) -> Result<Decimal, ValidationError> {
    withdrawals
        .iter()
        .filter(|w| w.kind == kind && w.status == status)
        .try_fold(Decimal::ZERO, |sum, w| sum.checked_add(w.amount).ok_or(ValidationError::Overflow))
}

pub fn compute_balance(
    investments: &[UserInvestment],
    fallback_cycle_days: u32,
    total_commission: Decimal,
    withdrawals: &[Withdrawal],
    limits: &WithdrawalLimits,
    now: DateTime<Utc>,
) -> Result<Balance, ValidationError> {
    let account = |kind: WithdrawalKind, credited: Decimal, minimum: Decimal| {
        Account::new(
            credited,
            drawn(withdrawals, kind, WithdrawalStatus::Completed)?,
            drawn(withdrawals, kind, WithdrawalStatus::Pending)?,
            minimum,
        )
    };
    Ok(Balance {
        returns: account(
            WithdrawalKind::Withdrawal,
            accrued_returns(investments, fallback_cycle_days, now)?,
            returns_minimum(investments, limits),
        )?,
        commissions: account(
            WithdrawalKind::CommissionWithdrawal,
            total_commission,
            limits.min_commission_withdrawal,
        )?,
    })
}

/// Checks a request for `amount` from the `kind` balance.
pub fn check_withdrawal(balance: &Balance, kind: WithdrawalKind, amount: Decimal) -> Result<(), WithdrawalError> {
    if amount <= Decimal::ZERO {
        return Err(WithdrawalError::NonPositive(amount));
    }
    let account = balance.account(kind);
    if amount < account.minimum {
        return Err(WithdrawalError::BelowMinimum {
            minimum: account.minimum,
            amount,
        });
    }
    if amount > account.available {
        return Err(WithdrawalError::Insufficient {
            available: account.available,
            amount,
        });
    }
    Ok(())
}
