use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;

/// Identifier of a profile, shared with the identity provider's user id.
pub type UserId = Uuid;

/// A user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    /// The ID of the profile.
    pub id: UserId,
    /// The email of the user.
    pub email: String,
    /// The full name of the user.
    pub full_name: Option<String>,
    /// The code other users register with to become this user's referrals.
    pub referral_code: Option<String>,
    /// The profile that referred this one, if any.
    pub referred_by: Option<UserId>,
    /// The timestamp when the profile was created.
    pub created_at: DateTime<Utc>,
}

/// A profile about to be inserted.
#[derive(Debug, Clone)]
pub struct NewProfile {
    /// The ID issued by the identity provider.
    pub id: UserId,
    /// The email of the user.
    pub email: String,
    /// The full name of the user.
    pub full_name: Option<String>,
    /// The generated referral code.
    pub referral_code: String,
    /// The resolved referrer.
    pub referred_by: Option<UserId>,
}

/// An investment plan rate-card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvestmentPlan {
    /// The ID of the plan.
    pub id: Uuid,
    /// The display name of the plan.
    pub name: String,
    /// The minimum entry amount.
    pub price: Decimal,
    /// The daily return as a percentage, `4.0` meaning 4% per day.
    pub daily_roi: Decimal,
    /// The minimum amount that can be withdrawn.
    pub min_withdrawal: Decimal,
}

/// The lifecycle state of a user investment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentStatus {
    Pending,
    Active,
    Completed,
    Rejected,
}

impl InvestmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    /// Whether `self -> next` is one of the forward transitions.
    pub fn can_transition_to(self, next: InvestmentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Pending, Self::Rejected)
                | (Self::Active, Self::Completed)
        )
    }

    /// Returns `next` if the transition is allowed.
    pub fn transition(self, next: InvestmentStatus) -> Result<InvestmentStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for InvestmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvestmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown investment status {other:?}")),
        }
    }
}

/// A user investment joined with its plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInvestment {
    /// The ID of the investment.
    pub id: Uuid,
    /// The ID of the owning user.
    pub user_id: UserId,
    /// The plan the investment was made under.
    pub plan: InvestmentPlan,
    /// The invested amount.
    pub amount: Decimal,
    /// The current status.
    pub status: InvestmentStatus,
    /// The contract start instant.
    pub created_at: DateTime<Utc>,
    /// The contract term captured at creation, if it was recorded.
    pub cycle_days: Option<u32>,
}

impl UserInvestment {
    pub fn is_active(&self) -> bool {
        self.status == InvestmentStatus::Active
    }
}

/// A referred profile with its nested investments, as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferredProfile {
    pub profile: Profile,
    pub investments: Vec<UserInvestment>,
}

/// Which balance a withdrawal draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalKind {
    /// Accrued investment returns.
    Withdrawal,
    /// Referral commissions.
    CommissionWithdrawal,
}

impl WithdrawalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Withdrawal => "withdrawal",
            Self::CommissionWithdrawal => "commission_withdrawal",
        }
    }
}

impl FromStr for WithdrawalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "withdrawal" => Ok(Self::Withdrawal),
            "commission_withdrawal" => Ok(Self::CommissionWithdrawal),
            other => Err(format!("unknown withdrawal kind {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Failed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    /// Pending and paid-out withdrawals both reduce what is left to withdraw.
    pub fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::Completed)
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown withdrawal status {other:?}")),
        }
    }
}

/// A withdrawal request and its payout state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// The ID of the withdrawal.
    pub id: Uuid,
    /// The ID of the requesting user.
    pub user_id: UserId,
    /// The balance it draws from.
    pub kind: WithdrawalKind,
    /// The requested amount.
    pub amount: Decimal,
    /// The payout state.
    pub status: WithdrawalStatus,
    /// The timestamp of the request.
    pub created_at: DateTime<Utc>,
}

/// A withdrawal about to be requested.
#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub user_id: UserId,
    pub kind: WithdrawalKind,
    pub amount: Decimal,
}

/// An in-app message shown to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        use InvestmentStatus::*;
        assert_eq!(Pending.transition(Active), Ok(Active));
        assert_eq!(Pending.transition(Rejected), Ok(Rejected));
        assert_eq!(Active.transition(Completed), Ok(Completed));

        for (from, to) in [
            (Active, Pending),
            (Completed, Active),
            (Rejected, Pending),
            (Pending, Completed),
            (Active, Rejected),
            (Completed, Completed),
        ] {
            assert!(from.transition(to).is_err(), "{from} -> {to} must be refused");
        }
    }

    #[test]
    fn status_parses_store_text() {
        assert_eq!("active".parse::<InvestmentStatus>(), Ok(InvestmentStatus::Active));
        assert!("Active".parse::<InvestmentStatus>().is_err());
        assert_eq!(InvestmentStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn withdrawal_kinds_use_ledger_names() {
        assert_eq!(
            "commission_withdrawal".parse::<WithdrawalKind>(),
            Ok(WithdrawalKind::CommissionWithdrawal)
        );
        assert_eq!(WithdrawalKind::Withdrawal.as_str(), "withdrawal");
        assert!(WithdrawalStatus::Pending.is_outstanding());
        assert!(!WithdrawalStatus::Rejected.is_outstanding());
    }
}
