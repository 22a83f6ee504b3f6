use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{DeviceInfo, IdentityProvider, Location, ReferralStore, SessionSink};
use crate::types::{
    InvestmentStatus, NewProfile, NewWithdrawal, Notification, Profile, ReferredProfile, UserId,
    UserInvestment, Withdrawal, WithdrawalStatus,
};

/// A tracked session as recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySession {
    pub user_id: UserId,
    pub device: DeviceInfo,
    pub location: Location,
    pub is_online: bool,
    pub touches: u32,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    profiles: Vec<Profile>,
    investments: Vec<UserInvestment>,
    cycle_days: Option<u32>,
    tokens: HashMap<String, UserId>,
    sessions: HashMap<Uuid, MemorySession>,
    withdrawals: Vec<Withdrawal>,
    notifications: Vec<Notification>,
    fail_referral_queries: bool,
    referral_delays: VecDeque<Duration>,
    referral_queries: usize,
    profile_inserts: usize,
}

/// In-process store with the same semantics as [`super::PgStore`].
///
/// Rows come back in insertion order. Referral queries can be delayed or
/// made to fail to exercise the aggregator's error and race handling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_profile(&self, profile: Profile) {
        self.inner().profiles.push(profile);
    }

    pub fn add_investment(&self, investment: UserInvestment) {
        self.inner().investments.push(investment);
    }

    pub fn set_cycle_days(&self, days: Option<u32>) {
        self.inner().cycle_days = days;
    }

    /// Makes `token` resolve to `user_id`.
    pub fn issue_token(&self, token: impl Into<String>, user_id: UserId) {
        self.inner().tokens.insert(token.into(), user_id);
    }

    pub fn fail_referral_queries(&self, fail: bool) {
        self.inner().fail_referral_queries = fail;
    }

    /// Delays the next referral query by `delay`. Delays queue up in order.
    pub fn delay_next_referral_query(&self, delay: Duration) {
        self.inner().referral_delays.push_back(delay);
    }

    pub fn referral_query_count(&self) -> usize {
        self.inner().referral_queries
    }

    pub fn profile_insert_count(&self) -> usize {
        self.inner().profile_inserts
    }

    pub fn investment_status(&self, id: Uuid) -> Option<InvestmentStatus> {
        self.inner()
            .investments
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.status)
    }

    /// Moves a withdrawal along its payout lifecycle.
    pub fn set_withdrawal_status(&self, id: Uuid, status: WithdrawalStatus) {
        if let Some(withdrawal) = self.inner().withdrawals.iter_mut().find(|w| w.id == id) {
            withdrawal.status = status;
        }
    }

    pub fn session(&self, id: Uuid) -> Option<MemorySession> {
        self.inner().sessions.get(&id).cloned()
    }
}

#[async_trait]
impl ReferralStore for MemoryStore {
    async fn profile(&self, id: UserId) -> Result<Option<Profile>> {
        Ok(self.inner().profiles.iter().find(|p| p.id == id).cloned())
    }

    async fn profile_by_referral_code(&self, code: &str) -> Result<Option<Profile>> {
        Ok(self
            .inner()
            .profiles
            .iter()
            .find(|p| p.referral_code.as_deref() == Some(code))
            .cloned())
    }

    async fn profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        Ok(self.inner().profiles.iter().find(|p| p.email == email).cloned())
    }

    async fn insert_profile(&self, new: &NewProfile) -> Result<Option<Profile>> {
        let mut inner = self.inner();
        inner.profile_inserts += 1;
        let taken = inner.profiles.iter().any(|p| {
            p.id == new.id
                || p.email == new.email
                || p.referral_code.as_deref() == Some(new.referral_code.as_str())
        });
        if taken {
            return Ok(None);
        }
        let profile = Profile {
            id: new.id,
            email: new.email.clone(),
            full_name: new.full_name.clone(),
            referral_code: Some(new.referral_code.clone()),
            referred_by: new.referred_by,
            created_at: Utc::now(),
        };
        inner.profiles.push(profile.clone());
        Ok(Some(profile))
    }

    async fn profiles_referred_by(&self, referrers: &[UserId]) -> Result<Vec<ReferredProfile>> {
        let delay = {
            let mut inner = self.inner();
            inner.referral_queries += 1;
            inner.referral_delays.pop_front()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.inner();
        if inner.fail_referral_queries {
            bail!("connection reset by peer");
        }
        Ok(inner
            .profiles
            .iter()
            .filter(|p| p.referred_by.is_some_and(|by| referrers.contains(&by)))
            .map(|p| ReferredProfile {
                profile: p.clone(),
                investments: inner
                    .investments
                    .iter()
                    .filter(|i| i.user_id == p.id)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    async fn investment(&self, id: Uuid) -> Result<Option<UserInvestment>> {
        Ok(self.inner().investments.iter().find(|i| i.id == id).cloned())
    }

    async fn active_investments(&self) -> Result<Vec<UserInvestment>> {
        Ok(self
            .inner()
            .investments
            .iter()
            .filter(|i| i.is_active())
            .cloned()
            .collect())
    }

    async fn complete_investment(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner();
        match inner.investments.iter_mut().find(|i| i.id == id) {
            Some(investment) => match investment.status.transition(InvestmentStatus::Completed) {
                Ok(next) => {
                    investment.status = next;
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            None => Ok(false),
        }
    }

    async fn investment_cycle_days(&self) -> Result<Option<u32>> {
        Ok(self.inner().cycle_days)
    }

    async fn investments_of(&self, user: UserId) -> Result<Vec<UserInvestment>> {
        Ok(self
            .inner()
            .investments
            .iter()
            .filter(|i| i.user_id == user)
            .cloned()
            .collect())
    }

    async fn withdrawals_of(&self, user: UserId) -> Result<Vec<Withdrawal>> {
        Ok(self
            .inner()
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user)
            .cloned()
            .collect())
    }

    async fn request_withdrawal(&self, new: &NewWithdrawal, credited: Decimal) -> Result<Option<Withdrawal>> {
        let mut inner = self.inner();
        let outstanding = inner
            .withdrawals
            .iter()
            .filter(|w| w.user_id == new.user_id && w.kind == new.kind && w.status.is_outstanding())
            .try_fold(Decimal::ZERO, |sum, w| sum.checked_add(w.amount));
        let fits = outstanding
            .and_then(|sum| sum.checked_add(new.amount))
            .is_some_and(|total| total <= credited);
        if !fits {
            return Ok(None);
        }
        let withdrawal = Withdrawal {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            kind: new.kind,
            amount: new.amount,
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
        };
        inner.withdrawals.push(withdrawal.clone());
        Ok(Some(withdrawal))
    }

    async fn insert_notification(&self, user: UserId, title: &str, message: &str) -> Result<()> {
        self.inner().notifications.push(Notification {
            id: Uuid::new_v4(),
            user_id: user,
            title: title.to_owned(),
            message: message.to_owned(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn notifications_of(&self, user: UserId) -> Result<Vec<Notification>> {
        Ok(self
            .inner()
            .notifications
            .iter()
            .rev()
            .filter(|n| n.user_id == user)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdentityProvider for MemoryStore {
    async fn current_user(&self, token: &str) -> Result<Option<Profile>> {
        let inner = self.inner();
        let Some(user_id) = inner.tokens.get(token) else {
            return Ok(None);
        };
        Ok(inner.profiles.iter().find(|p| p.id == *user_id).cloned())
    }
}

#[async_trait]
impl SessionSink for MemoryStore {
    async fn open_session(
        &self,
        user_id: UserId,
        device: &DeviceInfo,
        location: &Location,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.inner().sessions.insert(
            id,
            MemorySession {
                user_id,
                device: device.clone(),
                location: location.clone(),
                is_online: true,
                touches: 0,
                last_active: at,
            },
        );
        Ok(id)
    }

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            bail!("unknown session {session_id}");
        };
        session.touches += 1;
        session.is_online = true;
        session.last_active = at;
        Ok(())
    }

    async fn close_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            bail!("unknown session {session_id}");
        };
        session.is_online = false;
        session.last_active = at;
        Ok(())
    }
}
