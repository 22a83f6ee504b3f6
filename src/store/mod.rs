//! Access to the relational store and the identity provider.
//!
//! The service only talks to its backends through these traits, so the
//! Postgres implementation can be swapped for [`MemoryStore`] in tests.

mod memory;
mod postgres;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::accrual::MAX_CYCLE_DAYS;
use crate::types::{
    NewProfile, NewWithdrawal, Notification, Profile, ReferredProfile, UserId, UserInvestment,
    Withdrawal,
};
use rust_decimal::Decimal;

/// Query/update capability over profiles and investments.
#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn profile(&self, id: UserId) -> Result<Option<Profile>>;

    async fn profile_by_referral_code(&self, code: &str) -> Result<Option<Profile>>;

    async fn profile_by_email(&self, email: &str) -> Result<Option<Profile>>;

    /// Inserts `profile`. Returns `None` when a unique column (id, email or
    /// referral code) is already taken.
    async fn insert_profile(&self, profile: &NewProfile) -> Result<Option<Profile>>;

    /// Profiles whose `referred_by` is one of `referrers`, each with all of
    /// its investments and their plans.
    async fn profiles_referred_by(&self, referrers: &[UserId]) -> Result<Vec<ReferredProfile>>;

    async fn investment(&self, id: Uuid) -> Result<Option<UserInvestment>>;

    async fn active_investments(&self) -> Result<Vec<UserInvestment>>;

    /// Moves an investment from `active` to `completed`. Returns `false` if
    /// it was not active.
    async fn complete_investment(&self, id: Uuid) -> Result<bool>;

    /// The system-wide `investment_cycle_days` setting, if present.
    async fn investment_cycle_days(&self) -> Result<Option<u32>>;

    /// Every investment of `user`, oldest first.
    async fn investments_of(&self, user: UserId) -> Result<Vec<UserInvestment>>;

    async fn withdrawals_of(&self, user: UserId) -> Result<Vec<Withdrawal>>;

    /// Records a pending withdrawal unless the user's pending and completed
    /// withdrawals of the same kind would then exceed `credited`, in which
    /// case `None` is returned. Requests of one user are serialized.
    async fn request_withdrawal(&self, withdrawal: &NewWithdrawal, credited: Decimal) -> Result<Option<Withdrawal>>;

    async fn insert_notification(&self, user: UserId, title: &str, message: &str) -> Result<()>;

    /// Notifications of `user`, newest first.
    async fn notifications_of(&self, user: UserId) -> Result<Vec<Notification>>;
}

impl std::fmt::Debug for dyn ReferralStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ReferralStore")
    }
}

/// Resolves bearer tokens issued by the identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self, token: &str) -> Result<Option<Profile>>;
}

impl std::fmt::Debug for dyn SessionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn SessionSink")
    }
}

/// Device description recorded with a tracked session.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceInfo {
    pub browser: String,
    pub os: String,
    pub device: String,
}

/// Coarse location recorded with a tracked session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub country: String,
    pub city: String,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            country: "unknown".into(),
            city: "unknown".into(),
        }
    }
}

/// Persistence of user presence sessions.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn open_session(
        &self,
        user_id: UserId,
        device: &DeviceInfo,
        location: &Location,
        at: DateTime<Utc>,
    ) -> Result<Uuid>;

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn close_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// Parses the text value of the cycle-length setting.
pub(crate) fn parse_cycle_days(value: &str) -> Result<u32> {
    use anyhow::Context;
    let days = value
        .trim()
        .parse()
        .with_context(|| format!("investment_cycle_days is not a day count: {value:?}"))?;
    check_cycle_days(days).context("invalid investment_cycle_days setting")
}

/// Rejects contract terms longer than [`MAX_CYCLE_DAYS`].
pub(crate) fn check_cycle_days(days: u32) -> Result<u32> {
    if days > MAX_CYCLE_DAYS {
        bail!("cycle of {days} days exceeds the {MAX_CYCLE_DAYS}-day limit");
    }
    Ok(days)
}
