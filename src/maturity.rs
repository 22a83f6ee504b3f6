//! Completion of investments that reached the end of their term.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accrual::{AccrualTerms, is_cycle_completed};
use crate::store::ReferralStore;
use crate::types::InvestmentStatus;

/// The cycle length applied to investments without their own: the store's
/// `investment_cycle_days` setting, else `default_days`.
pub async fn fallback_cycle_days(store: &dyn ReferralStore, default_days: u32) -> Result<u32> {
    Ok(store
        .investment_cycle_days()
        .await
        .context("failed to read the investment cycle setting")?
        .unwrap_or(default_days))
}

pub const COMPLETION_TITLE: &str = "Investment completed";

/// Marks every active investment whose cycle is over as completed, notifies
/// its owner and returns the completed ids.
pub async fn complete_matured(
    store: &dyn ReferralStore,
    default_cycle_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let fallback = fallback_cycle_days(store, default_cycle_days).await?;
    let mut completed = Vec::new();
    for investment in store.active_investments().await? {
        let terms = AccrualTerms::for_investment(&investment, Some(fallback));
        if !is_cycle_completed(&terms, now) {
            continue;
        }
        investment.status.transition(InvestmentStatus::Completed)?;
        if store.complete_investment(investment.id).await? {
            info!(investment = %investment.id, user = %investment.user_id, "investment completed");
            let message = format!(
                "Your {} investment of {} has reached the end of its term.",
                investment.plan.name, investment.amount
            );
            if let Err(e) = store
                .insert_notification(investment.user_id, COMPLETION_TITLE, &message)
                .await
            {
                warn!(investment = %investment.id, error = %format!("{e:#}"), "failed to notify investor");
            }
            completed.push(investment.id);
        } else {
            debug!(investment = %investment.id, "investment left active state concurrently");
        }
    }
    Ok(completed)
}

/// Runs [`complete_matured`] every `every` until `shutdown` flips to true.
pub fn spawn_sweeper(
    store: Arc<dyn ReferralStore>,
    default_cycle_days: u32,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match complete_matured(store.as_ref(), default_cycle_days, Utc::now()).await {
                        Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "maturity sweep completed investments"),
                        Ok(_) => debug!("maturity sweep found nothing to complete"),
                        Err(e) => warn!(error = %format!("{e:#}"), "maturity sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{InvestmentPlan, UserInvestment};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn investment(status: InvestmentStatus, cycle_days: Option<u32>, started: DateTime<Utc>) -> UserInvestment {
        UserInvestment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan: InvestmentPlan {
                id: Uuid::new_v4(),
                name: "Silver".into(),
                price: Decimal::from(10_000),
                daily_roi: Decimal::from(1),
                min_withdrawal: Decimal::from(2_000),
            },
            amount: Decimal::from(10_000),
            status,
            created_at: started,
            cycle_days,
        }
    }

    #[tokio::test]
    async fn completes_only_matured_active_investments() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let now = start + chrono::Duration::days(45);
        let store = MemoryStore::new();
        store.set_cycle_days(Some(60));

        let own_term = investment(InvestmentStatus::Active, Some(30), start);
        let setting_term = investment(InvestmentStatus::Active, None, start);
        let pending = investment(InvestmentStatus::Pending, Some(30), start);
        for i in [&own_term, &setting_term, &pending] {
            store.add_investment(i.clone());
        }

        let done = complete_matured(&store, 90, now).await.unwrap();
        assert_eq!(done, vec![own_term.id]);
        assert_eq!(store.investment_status(own_term.id), Some(InvestmentStatus::Completed));
        assert_eq!(store.investment_status(setting_term.id), Some(InvestmentStatus::Active));
        assert_eq!(store.investment_status(pending.id), Some(InvestmentStatus::Pending));

        // the setting applies once the record has no term of its own
        let later = start + chrono::Duration::days(61);
        assert_eq!(complete_matured(&store, 90, later).await.unwrap(), vec![setting_term.id]);
        assert!(complete_matured(&store, 90, later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_notifies_the_investor() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let store = MemoryStore::new();
        let matured = investment(InvestmentStatus::Active, Some(30), start);
        let running = investment(InvestmentStatus::Active, Some(90), start);
        store.add_investment(matured.clone());
        store.add_investment(running.clone());

        complete_matured(&store, 60, start + chrono::Duration::days(31)).await.unwrap();

        let notes = store.notifications_of(matured.user_id).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, COMPLETION_TITLE);
        assert!(notes[0].message.contains("Silver"), "{}", notes[0].message);
        assert!(store.notifications_of(running.user_id).await.unwrap().is_empty());

        // completing nothing sends nothing
        complete_matured(&store, 60, start + chrono::Duration::days(32)).await.unwrap();
        assert_eq!(store.notifications_of(matured.user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn default_applies_without_setting() {
        let store = MemoryStore::new();
        assert_eq!(fallback_cycle_days(&store, 60).await.unwrap(), 60);
        store.set_cycle_days(Some(45));
        assert_eq!(fallback_cycle_days(&store, 60).await.unwrap(), 45);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let matured = investment(InvestmentStatus::Active, Some(1), Utc::now() - chrono::Duration::days(2));
        store.add_investment(matured.clone());

        let (stop, stopped) = watch::channel(false);
        let sweeper = spawn_sweeper(store.clone(), 60, Duration::from_secs(3600), stopped);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.investment_status(matured.id), Some(InvestmentStatus::Completed));

        stop.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
