//! Referral commission accrual and reporting.
//!
//! A [`ReferralAggregator`] is one viewer's referral dashboard: it loads the
//! profiles the viewer referred, reduces their investments into per-referral
//! commission figures, and keeps the last committed [`ReferralReport`].
//! Loads are stamped with a generation so that a slow, older load can never
//! overwrite the result of a newer one.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{AggregationError, LoadError};
use crate::graph::ReferralForest;
use crate::store::ReferralStore;
use crate::types::{InvestmentPlan, Profile, ReferredProfile, UserId};

/// Deepest referral level the aggregator will walk.
pub const MAX_REFERRAL_DEPTH: u8 = 3;

/// Commission rate for a plan: its `daily_roi` taken as a flat, one-time
/// percentage of each active investment.
pub fn commission_rate(plan: &InvestmentPlan) -> Decimal {
    plan.daily_roi / Decimal::ONE_HUNDRED
}

/// How a referred investment turns into commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionPolicy {
    /// [`commission_rate`] at every level.
    #[default]
    PlanDailyRoi,
    /// 5% at level 1, 2% at level 2, 1% at level 3.
    Tiered,
}

impl CommissionPolicy {
    pub fn rate(self, plan: &InvestmentPlan, level: u8) -> Decimal {
        match self {
            Self::PlanDailyRoi => commission_rate(plan),
            Self::Tiered => match level {
                1 => Decimal::new(5, 2),
                2 => Decimal::new(2, 2),
                3 => Decimal::new(1, 2),
                _ => Decimal::ZERO,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Active,
    Inactive,
}

/// One referred profile as shown to its referrer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferralSummary {
    pub referred_id: UserId,
    pub full_name: Option<String>,
    pub email: String,
    pub level: u8,
    pub status: ReferralStatus,
    /// Sum of the referred user's active investments.
    pub total_investment: Decimal,
    pub total_commission: Decimal,
    pub active_investments: usize,
    /// Start of the referred user's most recent investment, in any status.
    pub last_investment_at: Option<DateTime<Utc>>,
}

/// Reduces a referred profile's investments into its summary.
pub fn summarize(
    referred: &ReferredProfile,
    level: u8,
    policy: CommissionPolicy,
) -> Result<ReferralSummary, AggregationError> {
    let mut total_investment = Decimal::ZERO;
    let mut total_commission = Decimal::ZERO;
    let mut active_investments = 0;

    for investment in referred.investments.iter().filter(|i| i.is_active()) {
        if investment.amount.is_sign_negative() && !investment.amount.is_zero() {
            return Err(AggregationError::Malformed(format!(
                "investment {} has negative amount {}",
                investment.id, investment.amount
            )));
        }
        let rate = policy.rate(&investment.plan, level);
        if rate.is_sign_negative() && !rate.is_zero() {
            return Err(AggregationError::Malformed(format!(
                "plan {} has negative daily_roi {}",
                investment.plan.id, investment.plan.daily_roi
            )));
        }
        let overflow = || {
            AggregationError::Malformed(format!(
                "commission of profile {} does not fit a decimal",
                referred.profile.id
            ))
        };
        let commission = investment.amount.checked_mul(rate).ok_or_else(overflow)?;
        total_investment = total_investment.checked_add(investment.amount).ok_or_else(overflow)?;
        total_commission = total_commission.checked_add(commission).ok_or_else(overflow)?;
        active_investments += 1;
    }

    Ok(ReferralSummary {
        referred_id: referred.profile.id,
        full_name: referred.profile.full_name.clone(),
        email: referred.profile.email.clone(),
        level,
        status: if active_investments > 0 {
            ReferralStatus::Active
        } else {
            ReferralStatus::Inactive
        },
        total_investment,
        total_commission,
        active_investments,
        last_investment_at: referred.investments.iter().map(|i| i.created_at).max(),
    })
}

/// The referral dashboard of one user.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ReferralReport {
    pub referrals: Vec<ReferralSummary>,
    pub total_commission: Decimal,
    pub active_referrals: usize,
}

impl ReferralReport {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_referrals(referrals: Vec<ReferralSummary>) -> Result<Self, AggregationError> {
        let total_commission = referrals
            .iter()
            .try_fold(Decimal::ZERO, |sum, r| sum.checked_add(r.total_commission))
            .ok_or_else(|| AggregationError::Malformed("total commission does not fit a decimal".into()))?;
        let active_referrals = referrals
            .iter()
            .filter(|r| r.status == ReferralStatus::Active)
            .count();
        Ok(Self {
            referrals,
            total_commission,
            active_referrals,
        })
    }

    pub fn level_statistics(&self, level: u8) -> LevelStatistics {
        compute_level_statistics(&self.referrals, level)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelStatistics {
    pub level: u8,
    pub count: usize,
    pub total_commission: Decimal,
}

pub fn compute_level_statistics(referrals: &[ReferralSummary], level: u8) -> LevelStatistics {
    let (count, total_commission) = referrals
        .iter()
        .filter(|r| r.level == level)
        .fold((0, Decimal::ZERO), |(n, sum), r| (n + 1, sum.saturating_add(r.total_commission)));
    LevelStatistics {
        level,
        count,
        total_commission,
    }
}

/// `<origin>/register?ref=<code>`, or an empty string without a code.
pub fn referral_link(origin: &str, profile: Option<&Profile>) -> String {
    match profile
        .and_then(|p| p.referral_code.as_deref())
        .filter(|code| !code.is_empty())
    {
        Some(code) => format!("{}/register?ref={code}", origin.trim_end_matches('/')),
        None => String::new(),
    }
}

/// Walks the referral forest under `root` down to `depth` levels, one store
/// query per level.
pub async fn collect_forest(
    store: &dyn ReferralStore,
    root: UserId,
    depth: u8,
) -> Result<ReferralForest, AggregationError> {
    let mut forest = ReferralForest::new(root);
    let mut frontier = vec![root];
    for level in 1..=depth {
        if frontier.is_empty() {
            break;
        }
        let rows = store
            .profiles_referred_by(&frontier)
            .await
            .map_err(AggregationError::store)?;
        let mut next = Vec::with_capacity(rows.len());
        for referred in rows {
            let id = referred.profile.id;
            if forest.attach(referred)? {
                next.push(id);
            } else {
                warn!(profile = %id, "profile already in referral tree, skipping");
            }
        }
        debug!(%root, level, count = next.len(), "fetched referral level");
        frontier = next;
    }
    Ok(forest)
}

#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    /// Number of referral levels to load, `1..=MAX_REFERRAL_DEPTH`.
    pub depth: u8,
    pub timeout: Duration,
    /// Fail unauthenticated loads instead of answering with an empty report.
    pub strict_auth: bool,
    pub policy: CommissionPolicy,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            depth: 1,
            timeout: Duration::from_secs(10),
            strict_auth: false,
            policy: CommissionPolicy::PlanDailyRoi,
        }
    }
}

/// Result of a load that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// The load was the latest one and its report is now the view's state.
    Committed(ReferralReport),
    /// A newer load was started; this one was cancelled without touching
    /// state.
    Superseded,
}

/// The state left by the last load that committed.
#[derive(Debug, Clone, Default)]
struct Committed {
    generation: u64,
    report: ReferralReport,
    /// Set when that load failed; the report is empty then.
    error: Option<LoadError>,
}

impl Committed {
    fn outcome(self) -> Result<ReferralReport, LoadError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.report),
        }
    }
}

/// One viewer's referral dashboard state.
#[derive(Debug)]
pub struct ReferralAggregator {
    store: Arc<dyn ReferralStore>,
    settings: AggregatorSettings,
    latest: watch::Sender<u64>,
    committed: watch::Sender<Committed>,
}

impl ReferralAggregator {
    pub fn new(store: Arc<dyn ReferralStore>, settings: AggregatorSettings) -> Self {
        let (latest, _) = watch::channel(0);
        let (committed, _) = watch::channel(Committed::default());
        Self {
            store,
            settings,
            latest,
            committed,
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// The last committed report.
    pub fn report(&self) -> ReferralReport {
        self.committed.borrow().report.clone()
    }

    fn next_generation(&self) -> u64 {
        let mut generation = 0;
        self.latest.send_modify(|g| {
            *g += 1;
            generation = *g;
        });
        generation
    }

    /// Stores the outcome of load `generation` if it is still the latest
    /// one. A failed load leaves the empty report behind.
    fn commit(&self, generation: u64, outcome: Result<ReferralReport, LoadError>) -> bool {
        self.committed.send_if_modified(|state| {
            if *self.latest.borrow() != generation || generation <= state.generation {
                return false;
            }
            let (report, error) = match outcome {
                Ok(report) => (report, None),
                Err(err) => (ReferralReport::empty(), Some(err)),
            };
            *state = Committed {
                generation,
                report,
                error,
            };
            true
        })
    }

    /// Reloads the referrals of `current_user` and commits the new report.
    ///
    /// Failures reset the state to the empty report before they are
    /// returned. Starting another load cancels this one.
    pub async fn load_referrals(&self, current_user: Option<UserId>) -> Result<LoadOutcome, LoadError> {
        let generation = self.next_generation();
        self.run_load(generation, current_user).await
    }

    /// Like [`load_referrals`](Self::load_referrals), except that a load
    /// cancelled by a newer one answers with the outcome the newer load
    /// commits.
    pub async fn load_settled(&self, current_user: Option<UserId>) -> Result<ReferralReport, LoadError> {
        let generation = self.next_generation();
        match self.run_load(generation, current_user).await? {
            LoadOutcome::Committed(report) => Ok(report),
            LoadOutcome::Superseded => self.first_commit_after(generation).await,
        }
    }

    async fn first_commit_after(&self, generation: u64) -> Result<ReferralReport, LoadError> {
        let mut committed = self.committed.subscribe();
        let settled = async {
            loop {
                let state = committed.borrow_and_update().clone();
                if state.generation > generation {
                    return state.outcome();
                }
                if committed.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        // the newer load is itself bounded by the same timeout
        match tokio::time::timeout(self.settings.timeout, settled).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AggregationError::TimedOut(self.settings.timeout).into()),
        }
    }

    async fn run_load(&self, generation: u64, current_user: Option<UserId>) -> Result<LoadOutcome, LoadError> {
        let Some(user) = current_user else {
            let outcome = if self.settings.strict_auth {
                Err(LoadError::Unauthenticated)
            } else {
                Ok(ReferralReport::empty())
            };
            if !self.commit(generation, outcome.clone()) {
                return Ok(LoadOutcome::Superseded);
            }
            if outcome.is_ok() {
                warn!("referral load without a session, answering empty");
            }
            return outcome.map(LoadOutcome::Committed);
        };

        let mut newer = self.latest.subscribe();
        let superseded = async move {
            loop {
                if *newer.borrow_and_update() != generation {
                    return;
                }
                if newer.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        let fetched = tokio::select! {
            biased;
            _ = superseded => {
                debug!(%user, generation, "referral load superseded");
                return Ok(LoadOutcome::Superseded);
            }
            fetched = tokio::time::timeout(self.settings.timeout, self.build_report(user)) => fetched,
        };

        let result = match fetched {
            Ok(result) => result,
            Err(_) => Err(AggregationError::TimedOut(self.settings.timeout)),
        };
        if !self.commit(generation, result.clone().map_err(LoadError::from)) {
            return Ok(LoadOutcome::Superseded);
        }
        match result {
            Ok(report) => {
                info!(
                    %user,
                    referrals = report.referrals.len(),
                    active = report.active_referrals,
                    total_commission = %report.total_commission,
                    "referrals loaded"
                );
                Ok(LoadOutcome::Committed(report))
            }
            Err(err) => {
                warn!(%user, error = %err, "referral load failed, state reset");
                Err(err.into())
            }
        }
    }

    async fn build_report(&self, user: UserId) -> Result<ReferralReport, AggregationError> {
        let depth = self.settings.depth.clamp(1, MAX_REFERRAL_DEPTH);
        let forest = collect_forest(self.store.as_ref(), user, depth).await?;
        let referrals = forest
            .levels()
            .map(|(level, referred)| summarize(referred, level, self.settings.policy))
            .collect::<Result<Vec<_>, _>>()?;
        ReferralReport::from_referrals(referrals)
    }

    /// Summaries of the profiles exactly `level` hops below `user`.
    ///
    /// Does not touch the committed report.
    pub async fn referrals_at_level(
        &self,
        user: UserId,
        level: u8,
    ) -> Result<Vec<ReferralSummary>, AggregationError> {
        if level == 0 || level > MAX_REFERRAL_DEPTH {
            return Ok(Vec::new());
        }
        let forest = tokio::time::timeout(
            self.settings.timeout,
            collect_forest(self.store.as_ref(), user, level),
        )
        .await
        .map_err(|_| AggregationError::TimedOut(self.settings.timeout))??;
        forest
            .referrals_at_level(level)
            .into_iter()
            .map(|referred| summarize(referred, level, self.settings.policy))
            .collect()
    }
}

/// Per-user aggregators for a multi-user server.
///
/// A user's aggregator lives only while some request holds a
/// [`ViewLease`] on it, so concurrent requests of one user share load
/// generations and idle users cost nothing.
#[derive(Debug)]
pub struct ReferralViews {
    store: Arc<dyn ReferralStore>,
    settings: AggregatorSettings,
    views: Mutex<HashMap<UserId, Arc<ReferralAggregator>>>,
}

/// Access to one user's aggregator for the duration of a request.
#[derive(Debug)]
pub struct ViewLease<'a> {
    views: &'a ReferralViews,
    user: UserId,
    view: Arc<ReferralAggregator>,
}

impl Deref for ViewLease<'_> {
    type Target = ReferralAggregator;

    fn deref(&self) -> &ReferralAggregator {
        &self.view
    }
}

impl Drop for ViewLease<'_> {
    fn drop(&mut self) {
        let mut views = self.views.lock();
        // held by the map and by this lease only
        if Arc::strong_count(&self.view) == 2 {
            views.remove(&self.user);
        }
    }
}

impl ReferralViews {
    pub fn new(store: Arc<dyn ReferralStore>, settings: AggregatorSettings) -> Self {
        Self {
            store,
            settings,
            views: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Arc<ReferralAggregator>>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The aggregator of `user`, shared with every other open lease.
    pub fn lease(&self, user: UserId) -> ViewLease<'_> {
        let view = Arc::clone(
            self.lock()
                .entry(user)
                .or_insert_with(|| Arc::new(ReferralAggregator::new(Arc::clone(&self.store), self.settings))),
        );
        ViewLease {
            views: self,
            user,
            view,
        }
    }

    /// Number of users with an aggregator in use.
    pub fn open_views(&self) -> usize {
        self.lock().len()
    }

    fn detached(&self) -> ReferralAggregator {
        ReferralAggregator::new(Arc::clone(&self.store), self.settings)
    }

    pub async fn load(&self, user: Option<UserId>) -> Result<LoadOutcome, LoadError> {
        match user {
            Some(user) => self.lease(user).load_referrals(Some(user)).await,
            None => self.detached().load_referrals(None).await,
        }
    }

    /// Loads the report of `user`; see [`ReferralAggregator::load_settled`].
    pub async fn load_settled(&self, user: Option<UserId>) -> Result<ReferralReport, LoadError> {
        match user {
            Some(user) => self.lease(user).load_settled(Some(user)).await,
            None => self.detached().load_settled(None).await,
        }
    }

    pub async fn referrals_at_level(
        &self,
        user: UserId,
        level: u8,
    ) -> Result<Vec<ReferralSummary>, AggregationError> {
        self.detached().referrals_at_level(user, level).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{InvestmentStatus, UserInvestment};
    use chrono::{Duration as Days, TimeZone};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    fn plan(daily_roi: Decimal) -> InvestmentPlan {
        InvestmentPlan {
            id: Uuid::new_v4(),
            name: "Gold".into(),
            price: Decimal::from(5000),
            daily_roi,
            min_withdrawal: Decimal::from(1000),
        }
    }

    fn profile(name: &str, referred_by: Option<UserId>) -> Profile {
        Profile {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", name.to_lowercase()),
            full_name: Some(name.into()),
            referral_code: Some(name.to_uppercase()),
            referred_by,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn investment(
        user: UserId,
        amount: i64,
        daily_roi: Decimal,
        status: InvestmentStatus,
        day: i64,
    ) -> UserInvestment {
        UserInvestment {
            id: Uuid::new_v4(),
            user_id: user,
            plan: plan(daily_roi),
            amount: Decimal::from(amount),
            status,
            created_at: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap() + Days::days(day),
            cycle_days: Some(90),
        }
    }

    /// Alice referred Bob (active) and Carol (inactive); Bob referred Dan.
    fn seeded() -> (Arc<MemoryStore>, Profile, Profile, Profile) {
        let store = MemoryStore::new();
        let alice = profile("Alice", None);
        let bob = profile("Bob", Some(alice.id));
        let carol = profile("Carol", Some(alice.id));
        let dan = profile("Dan", Some(bob.id));
        for p in [&alice, &bob, &carol, &dan] {
            store.add_profile(p.clone());
        }
        store.add_investment(investment(bob.id, 10_000, Decimal::from(4), InvestmentStatus::Active, 0));
        store.add_investment(investment(bob.id, 5_000, Decimal::from(2), InvestmentStatus::Active, 3));
        store.add_investment(investment(bob.id, 7_000, Decimal::from(4), InvestmentStatus::Pending, 9));
        store.add_investment(investment(carol.id, 20_000, Decimal::from(4), InvestmentStatus::Completed, 1));
        store.add_investment(investment(dan.id, 1_000, Decimal::from(4), InvestmentStatus::Active, 2));
        (Arc::new(store), alice, bob, carol)
    }

    fn aggregator(store: &Arc<MemoryStore>, settings: AggregatorSettings) -> ReferralAggregator {
        let store: Arc<dyn ReferralStore> = store.clone();
        ReferralAggregator::new(store, settings)
    }

    fn committed(outcome: LoadOutcome) -> ReferralReport {
        match outcome {
            LoadOutcome::Committed(report) => report,
            LoadOutcome::Superseded => panic!("load was superseded"),
        }
    }

    #[test]
    fn commission_rate_is_daily_roi_percentage() {
        assert_eq!(commission_rate(&plan(Decimal::from(4))), Decimal::new(4, 2));
        assert_eq!(
            CommissionPolicy::Tiered.rate(&plan(Decimal::from(4)), 2),
            Decimal::new(2, 2)
        );
        assert_eq!(CommissionPolicy::Tiered.rate(&plan(Decimal::from(4)), 4), Decimal::ZERO);
    }

    #[tokio::test]
    async fn direct_referrals_are_summarized() {
        let (store, alice, bob, carol) = seeded();
        let agg = aggregator(&store, AggregatorSettings::default());

        let report = committed(assert_ok!(agg.load_referrals(Some(alice.id)).await));

        assert_eq!(report.referrals.len(), 2);
        let b = &report.referrals[0];
        assert_eq!(b.referred_id, bob.id);
        assert_eq!(b.level, 1);
        assert_eq!(b.status, ReferralStatus::Active);
        assert_eq!(b.active_investments, 2);
        assert_eq!(b.total_investment, Decimal::from(15_000));
        // 10000 * 4% + 5000 * 2%
        assert_eq!(b.total_commission, Decimal::from(500));
        assert_eq!(
            b.last_investment_at,
            Some(Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap())
        );

        let c = &report.referrals[1];
        assert_eq!(c.referred_id, carol.id);
        assert_eq!(c.status, ReferralStatus::Inactive);
        assert_eq!(c.total_investment, Decimal::ZERO);
        assert_eq!(c.total_commission, Decimal::ZERO);

        assert_eq!(report.total_commission, Decimal::from(500));
        assert_eq!(report.active_referrals, 1);
        assert_eq!(agg.report(), report);
    }

    #[tokio::test]
    async fn aggregates_match_their_entries() {
        let (store, alice, ..) = seeded();
        let agg = aggregator(
            &store,
            AggregatorSettings {
                depth: 3,
                ..AggregatorSettings::default()
            },
        );
        let report = committed(assert_ok!(agg.load_referrals(Some(alice.id)).await));

        let sum: Decimal = report.referrals.iter().map(|r| r.total_commission).sum();
        let active = report
            .referrals
            .iter()
            .filter(|r| r.status == ReferralStatus::Active)
            .count();
        assert_eq!(report.total_commission, sum);
        assert_eq!(report.active_referrals, active);
        assert!(report.referrals.iter().all(|r| r.total_commission >= Decimal::ZERO));
    }

    #[tokio::test]
    async fn deeper_levels_follow_the_forest() {
        let (store, alice, ..) = seeded();
        let agg = aggregator(
            &store,
            AggregatorSettings {
                depth: 2,
                policy: CommissionPolicy::Tiered,
                ..AggregatorSettings::default()
            },
        );
        let report = committed(assert_ok!(agg.load_referrals(Some(alice.id)).await));

        let levels: Vec<u8> = report.referrals.iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![1, 1, 2]);
        // 15000 * 5% at level 1, 1000 * 2% at level 2
        assert_eq!(report.level_statistics(1).total_commission, Decimal::from(750));
        assert_eq!(
            report.level_statistics(2),
            LevelStatistics {
                level: 2,
                count: 1,
                total_commission: Decimal::from(20),
            }
        );
        assert_eq!(report.level_statistics(3).count, 0);
        assert_eq!(store.referral_query_count(), 2);
    }

    #[tokio::test]
    async fn default_depth_only_reports_level_one() {
        let (store, alice, ..) = seeded();
        let agg = aggregator(&store, AggregatorSettings::default());
        let report = committed(assert_ok!(agg.load_referrals(Some(alice.id)).await));
        assert!(report.referrals.iter().all(|r| r.level == 1));
        assert_eq!(report.level_statistics(2).count, 0);
        assert_eq!(store.referral_query_count(), 1);
    }

    #[tokio::test]
    async fn referrals_at_level_walks_down() {
        let (store, alice, bob, _) = seeded();
        let agg = aggregator(&store, AggregatorSettings::default());

        let second = assert_ok!(agg.referrals_at_level(alice.id, 2).await);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].level, 2);
        assert_eq!(second[0].email, "dan@example.com");
        assert_eq!(second[0].total_commission, Decimal::from(40));

        let from_bob = assert_ok!(agg.referrals_at_level(bob.id, 1).await);
        assert_eq!(from_bob.len(), 1);
        assert!(assert_ok!(agg.referrals_at_level(alice.id, 3).await).is_empty());
        assert!(assert_ok!(agg.referrals_at_level(alice.id, 0).await).is_empty());
        // the committed report is untouched
        assert_eq!(agg.report(), ReferralReport::empty());
    }

    #[tokio::test]
    async fn repeated_loads_are_identical() {
        let (store, alice, ..) = seeded();
        let agg = aggregator(&store, AggregatorSettings::default());
        let first = committed(assert_ok!(agg.load_referrals(Some(alice.id)).await));
        let second = committed(assert_ok!(agg.load_referrals(Some(alice.id)).await));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unauthenticated_load_answers_empty() {
        let (store, alice, ..) = seeded();
        let agg = aggregator(&store, AggregatorSettings::default());
        assert_ok!(agg.load_referrals(Some(alice.id)).await);

        let report = committed(assert_ok!(agg.load_referrals(None).await));
        assert_eq!(report, ReferralReport::empty());
        assert_eq!(agg.report(), ReferralReport::empty());
    }

    #[tokio::test]
    async fn strict_auth_reports_unauthenticated() {
        let (store, ..) = seeded();
        let agg = aggregator(
            &store,
            AggregatorSettings {
                strict_auth: true,
                ..AggregatorSettings::default()
            },
        );
        assert_eq!(agg.load_referrals(None).await, Err(LoadError::Unauthenticated));
    }

    #[tokio::test]
    async fn store_failure_resets_state() {
        let (store, alice, ..) = seeded();
        let agg = aggregator(&store, AggregatorSettings::default());
        assert_ok!(agg.load_referrals(Some(alice.id)).await);
        assert_eq!(agg.report().active_referrals, 1);

        store.fail_referral_queries(true);
        let err = assert_err!(agg.load_referrals(Some(alice.id)).await);
        assert!(matches!(err, LoadError::Aggregation(AggregationError::Store(_))));
        assert_eq!(agg.report(), ReferralReport::empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let (store, alice, ..) = seeded();
        store.delay_next_referral_query(Duration::from_secs(30));
        let agg = aggregator(&store, AggregatorSettings::default());

        let err = assert_err!(agg.load_referrals(Some(alice.id)).await);
        assert_eq!(
            err,
            LoadError::Aggregation(AggregationError::TimedOut(Duration::from_secs(10)))
        );
        assert!(AggregationError::TimedOut(Duration::from_secs(10)).is_retryable());
        assert_eq!(agg.report(), ReferralReport::empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_load_cancels_older_one() {
        let (store, alice, bob, _) = seeded();
        store.delay_next_referral_query(Duration::from_secs(5));
        let agg = Arc::new(aggregator(&store, AggregatorSettings::default()));

        let slow = tokio::spawn({
            let agg = Arc::clone(&agg);
            async move { agg.load_referrals(Some(alice.id)).await }
        });
        while store.referral_query_count() == 0 {
            tokio::task::yield_now().await;
        }

        // backing data changes between the two loads
        store.add_investment(investment(bob.id, 1_000, Decimal::from(4), InvestmentStatus::Active, 20));
        let fresh = committed(assert_ok!(agg.load_referrals(Some(alice.id)).await));
        assert_eq!(fresh.total_commission, Decimal::from(540));

        let stale = assert_ok!(slow.await.unwrap());
        assert_eq!(stale, LoadOutcome::Superseded);
        assert_eq!(agg.report(), fresh);
    }

    #[tokio::test]
    async fn referral_cycle_is_cut() {
        let store = MemoryStore::new();
        let root = profile("Root", None);
        // a cycle: the root claims to be referred by its own referral
        let child = profile("Child", Some(root.id));
        let mut looped = root.clone();
        looped.referred_by = Some(child.id);
        store.add_profile(looped);
        store.add_profile(child.clone());
        let store = Arc::new(store);
        let agg = aggregator(
            &store,
            AggregatorSettings {
                depth: 3,
                ..AggregatorSettings::default()
            },
        );

        let report = committed(assert_ok!(agg.load_referrals(Some(root.id)).await));
        assert_eq!(report.referrals.len(), 1);
        assert_eq!(report.referrals[0].referred_id, child.id);
    }

    #[tokio::test]
    async fn views_live_while_leased() {
        let (store, alice, bob, _) = seeded();
        let views = ReferralViews::new(store.clone(), AggregatorSettings::default());

        let first = views.lease(alice.id);
        let second = views.lease(alice.id);
        let other = views.lease(bob.id);
        assert!(std::ptr::eq(&*first, &*second));
        assert!(!std::ptr::eq(&*first, &*other));
        assert_eq!(views.open_views(), 2);

        drop(first);
        assert_eq!(views.open_views(), 2);
        drop(second);
        drop(other);
        assert_eq!(views.open_views(), 0);

        let report = committed(assert_ok!(views.load(Some(alice.id)).await));
        assert_eq!(report.referrals.len(), 2);
        assert_eq!(views.open_views(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_answers_with_newer_report() {
        let (store, alice, ..) = seeded();
        store.delay_next_referral_query(Duration::from_secs(5));
        store.delay_next_referral_query(Duration::from_secs(1));
        let views = Arc::new(ReferralViews::new(store.clone(), AggregatorSettings::default()));

        let slow = tokio::spawn({
            let views = Arc::clone(&views);
            async move { views.load_settled(Some(alice.id)).await }
        });
        while store.referral_query_count() == 0 {
            tokio::task::yield_now().await;
        }

        let fresh = assert_ok!(views.load_settled(Some(alice.id)).await);
        assert_eq!(fresh.referrals.len(), 2);
        assert_eq!(fresh.total_commission, Decimal::from(500));

        let stale = assert_ok!(slow.await.unwrap());
        assert_eq!(stale, fresh);
        assert_eq!(views.open_views(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_shares_newer_failure() {
        let (store, alice, ..) = seeded();
        store.delay_next_referral_query(Duration::from_secs(5));
        let views = Arc::new(ReferralViews::new(store.clone(), AggregatorSettings::default()));

        let slow = tokio::spawn({
            let views = Arc::clone(&views);
            async move { views.load_settled(Some(alice.id)).await }
        });
        while store.referral_query_count() == 0 {
            tokio::task::yield_now().await;
        }

        store.fail_referral_queries(true);
        let err = assert_err!(views.load_settled(Some(alice.id)).await);
        assert!(matches!(err, LoadError::Aggregation(AggregationError::Store(_))));
        assert_eq!(slow.await.unwrap(), Err(err));
    }

    #[tokio::test]
    async fn malformed_rows_fail_the_load() {
        let (store, alice, bob, _) = seeded();
        let agg = aggregator(&store, AggregatorSettings::default());
        assert_ok!(agg.load_referrals(Some(alice.id)).await);
        assert_eq!(agg.report().active_referrals, 1);

        store.add_investment(investment(bob.id, -250, Decimal::from(4), InvestmentStatus::Active, 4));
        let err = assert_err!(agg.load_referrals(Some(alice.id)).await);
        let LoadError::Aggregation(err) = err else {
            panic!("expected an aggregation error, got {err:?}");
        };
        assert!(matches!(err, AggregationError::Malformed(_)));
        assert!(!err.is_retryable());
        assert_eq!(agg.report(), ReferralReport::empty());
    }

    #[test]
    fn negative_rate_is_malformed() {
        let bob = profile("Bob", None);
        let referred = ReferredProfile {
            profile: bob.clone(),
            investments: vec![investment(bob.id, 1_000, Decimal::from(-1), InvestmentStatus::Active, 0)],
        };
        assert!(matches!(
            summarize(&referred, 1, CommissionPolicy::PlanDailyRoi),
            Err(AggregationError::Malformed(_))
        ));
        // tiered rates never read the plan
        assert!(summarize(&referred, 1, CommissionPolicy::Tiered).is_ok());
    }

    #[test]
    fn commission_overflow_is_malformed() {
        let bob = profile("Bob", None);
        let mut huge = investment(bob.id, 0, Decimal::from(100), InvestmentStatus::Active, 0);
        huge.amount = Decimal::MAX;
        let referred = ReferredProfile {
            profile: bob,
            investments: vec![huge.clone(), huge],
        };
        assert!(matches!(
            summarize(&referred, 1, CommissionPolicy::PlanDailyRoi),
            Err(AggregationError::Malformed(_))
        ));
    }

    #[test]
    fn level_statistics_count_and_sum() {
        let entry = |level, commission: i64| ReferralSummary {
            referred_id: Uuid::new_v4(),
            full_name: None,
            email: String::new(),
            level,
            status: ReferralStatus::Active,
            total_investment: Decimal::ZERO,
            total_commission: Decimal::from(commission),
            active_investments: 1,
            last_investment_at: None,
        };
        let referrals = vec![entry(1, 100), entry(2, 30), entry(1, 50)];
        assert_eq!(
            compute_level_statistics(&referrals, 1),
            LevelStatistics {
                level: 1,
                count: 2,
                total_commission: Decimal::from(150),
            }
        );
        assert_eq!(compute_level_statistics(&referrals, 3).count, 0);
    }

    #[test]
    fn referral_link_needs_a_code() {
        let mut p = profile("abc123", None);
        assert_eq!(
            referral_link("https://horizon.example", Some(&p)),
            "https://horizon.example/register?ref=ABC123"
        );
        assert_eq!(
            referral_link("https://horizon.example/", Some(&p)),
            "https://horizon.example/register?ref=ABC123"
        );
        assert_eq!(referral_link("https://horizon.example", None), "");
        p.referral_code = None;
        assert_eq!(referral_link("https://horizon.example", Some(&p)), "");
        p.referral_code = Some(String::new());
        assert_eq!(referral_link("https://horizon.example", Some(&p)), "");
    }
}
