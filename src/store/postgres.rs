use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, types::Json};
use uuid::Uuid;

use super::{
    DeviceInfo, IdentityProvider, Location, ReferralStore, SessionSink, check_cycle_days,
    parse_cycle_days,
};
use crate::types::{
    InvestmentPlan, NewProfile, NewWithdrawal, Notification, Profile, ReferredProfile, UserId,
    UserInvestment, Withdrawal,
};

const PROFILE_COLUMNS: &str = "id, email, full_name, referral_code, referred_by, created_at";

const INVESTMENT_SELECT: &str = r#"
    SELECT ui.id, ui.user_id, ui.amount, ui.status, ui.created_at, ui.cycle_days,
           p.id AS plan_id, p.name AS plan_name, p.price AS plan_price,
           p.daily_roi AS plan_daily_roi, p.min_withdrawal AS plan_min_withdrawal
    FROM user_investments ui
    JOIN investment_plans p ON p.id = ui.plan_id
"#;

/// Postgres-backed store.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct InvestmentRow {
    id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    status: String,
    created_at: DateTime<Utc>,
    cycle_days: Option<i32>,
    plan_id: Uuid,
    plan_name: String,
    plan_price: Decimal,
    plan_daily_roi: Decimal,
    plan_min_withdrawal: Decimal,
}

impl TryFrom<InvestmentRow> for UserInvestment {
    type Error = anyhow::Error;

    fn try_from(row: InvestmentRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| anyhow!("investment {}: {e}", row.id))?;
        let cycle_days = row
            .cycle_days
            .map(|days| {
                u32::try_from(days)
                    .map_err(anyhow::Error::from)
                    .and_then(check_cycle_days)
            })
            .transpose()
            .with_context(|| format!("investment {} has an invalid cycle_days", row.id))?;
        Ok(UserInvestment {
            id: row.id,
            user_id: row.user_id,
            plan: InvestmentPlan {
                id: row.plan_id,
                name: row.plan_name,
                price: row.plan_price,
                daily_roi: row.plan_daily_roi,
                min_withdrawal: row.plan_min_withdrawal,
            },
            amount: row.amount,
            status,
            created_at: row.created_at,
            cycle_days,
        })
    }
}

const WITHDRAWAL_COLUMNS: &str = "id, user_id, type, amount, status, created_at";

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    user_id: Uuid,
    #[sqlx(rename = "type")]
    kind: String,
    amount: Decimal,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<WithdrawalRow> for Withdrawal {
    type Error = anyhow::Error;

    fn try_from(row: WithdrawalRow) -> Result<Self> {
        Ok(Withdrawal {
            id: row.id,
            user_id: row.user_id,
            kind: row
                .kind
                .parse()
                .map_err(|e: String| anyhow!("transaction {}: {e}", row.id))?,
            amount: row.amount,
            status: row
                .status
                .parse()
                .map_err(|e: String| anyhow!("transaction {}: {e}", row.id))?,
            created_at: row.created_at,
        })
    }
}

fn into_investments(rows: Vec<InvestmentRow>) -> Result<Vec<UserInvestment>> {
    rows.into_iter().map(UserInvestment::try_from).collect()
}

#[async_trait]
impl ReferralStore for PgStore {
    async fn profile(&self, id: UserId) -> Result<Option<Profile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1");
        let row = sqlx::query_as::<_, Profile>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch profile")?;
        Ok(row)
    }

    async fn profile_by_referral_code(&self, code: &str) -> Result<Option<Profile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE referral_code = $1");
        let row = sqlx::query_as::<_, Profile>(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up referral code")?;
        Ok(row)
    }

    async fn profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE email = $1");
        let row = sqlx::query_as::<_, Profile>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up profile by email")?;
        Ok(row)
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Option<Profile>> {
        let sql = format!(
            "INSERT INTO profiles (id, email, full_name, referral_code, referred_by) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING RETURNING {PROFILE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Profile>(&sql)
            .bind(profile.id)
            .bind(&profile.email)
            .bind(&profile.full_name)
            .bind(&profile.referral_code)
            .bind(profile.referred_by)
            .fetch_optional(&self.pool)
            .await
            .context("failed to insert profile")?;
        Ok(row)
    }

    async fn profiles_referred_by(&self, referrers: &[UserId]) -> Result<Vec<ReferredProfile>> {
        if referrers.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE referred_by = ANY($1) ORDER BY created_at, id"
        );
        let profiles = sqlx::query_as::<_, Profile>(&sql)
            .bind(referrers.to_vec())
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch referred profiles")?;
        if profiles.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = profiles.iter().map(|p| p.id).collect();
        let sql = format!("{INVESTMENT_SELECT} WHERE ui.user_id = ANY($1) ORDER BY ui.created_at, ui.id");
        let rows = sqlx::query_as::<_, InvestmentRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch referred investments")?;

        let mut by_user: HashMap<Uuid, Vec<UserInvestment>> = HashMap::new();
        for investment in into_investments(rows)? {
            by_user.entry(investment.user_id).or_default().push(investment);
        }

        Ok(profiles
            .into_iter()
            .map(|profile| {
                let investments = by_user.remove(&profile.id).unwrap_or_default();
                ReferredProfile {
                    profile,
                    investments,
                }
            })
            .collect())
    }

    async fn investment(&self, id: Uuid) -> Result<Option<UserInvestment>> {
        let sql = format!("{INVESTMENT_SELECT} WHERE ui.id = $1");
        let row = sqlx::query_as::<_, InvestmentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch investment")?;
        row.map(UserInvestment::try_from).transpose()
    }

    async fn active_investments(&self) -> Result<Vec<UserInvestment>> {
        let sql = format!("{INVESTMENT_SELECT} WHERE ui.status = 'active' ORDER BY ui.created_at");
        let rows = sqlx::query_as::<_, InvestmentRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch active investments")?;
        into_investments(rows)
    }

    async fn complete_investment(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE user_investments SET status = 'completed' WHERE id = $1 AND status = 'active'"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to complete investment")?;
        Ok(res.rows_affected() == 1)
    }

    async fn investment_cycle_days(&self) -> Result<Option<u32>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"SELECT value FROM system_settings WHERE key = 'investment_cycle_days'"#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to read investment_cycle_days")?;
        value.as_deref().map(parse_cycle_days).transpose()
    }

    async fn investments_of(&self, user: UserId) -> Result<Vec<UserInvestment>> {
        let sql = format!("{INVESTMENT_SELECT} WHERE ui.user_id = $1 ORDER BY ui.created_at, ui.id");
        let rows = sqlx::query_as::<_, InvestmentRow>(&sql)
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch user investments")?;
        into_investments(rows)
    }

    async fn withdrawals_of(&self, user: UserId) -> Result<Vec<Withdrawal>> {
        let sql = format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM transactions WHERE user_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch withdrawals")?;
        rows.into_iter().map(Withdrawal::try_from).collect()
    }

    async fn request_withdrawal(&self, withdrawal: &NewWithdrawal, credited: Decimal) -> Result<Option<Withdrawal>> {
        let mut tx = self.pool.begin().await.context("failed to begin withdrawal")?;

        // held until commit; one request per user at a time
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(withdrawal.user_id)
            .execute(&mut *tx)
            .await
            .context("failed to lock withdrawals")?;

        let outstanding = sqlx::query_scalar::<_, Decimal>(
            r#"SELECT COALESCE(SUM(amount), 0) FROM transactions
               WHERE user_id = $1 AND type = $2 AND status IN ('pending', 'completed')"#,
        )
        .bind(withdrawal.user_id)
        .bind(withdrawal.kind.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("failed to sum outstanding withdrawals")?;

        let fits = outstanding
            .checked_add(withdrawal.amount)
            .is_some_and(|total| total <= credited);
        if !fits {
            return Ok(None);
        }

        let sql = format!(
            "INSERT INTO transactions (id, user_id, type, amount, status) \
             VALUES ($1, $2, $3, $4, 'pending') RETURNING {WITHDRAWAL_COLUMNS}"
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(withdrawal.user_id)
            .bind(withdrawal.kind.as_str())
            .bind(withdrawal.amount)
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert withdrawal")?;

        tx.commit().await.context("failed to commit withdrawal")?;
        Withdrawal::try_from(row).map(Some)
    }

    async fn insert_notification(&self, user: UserId, title: &str, message: &str) -> Result<()> {
        sqlx::query(r#"INSERT INTO notifications (id, user_id, title, message) VALUES ($1, $2, $3, $4)"#)
            .bind(Uuid::new_v4())
            .bind(user)
            .bind(title)
            .bind(message)
            .execute(&self.pool)
            .await
            .context("failed to insert notification")?;
        Ok(())
    }

    async fn notifications_of(&self, user: UserId) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"SELECT id, user_id, title, message, created_at FROM notifications
               WHERE user_id = $1 ORDER BY created_at DESC, id"#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch notifications")?;
        Ok(rows)
    }
}

#[async_trait]
impl IdentityProvider for PgStore {
    async fn current_user(&self, token: &str) -> Result<Option<Profile>> {
        let row = sqlx::query_as::<_, Profile>(
            r#"SELECT p.id, p.email, p.full_name, p.referral_code, p.referred_by, p.created_at
               FROM auth_sessions s JOIN profiles p ON p.id = s.user_id
               WHERE s.token = $1 AND s.expires_at > now()"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("failed to resolve session token")?;
        Ok(row)
    }
}

#[async_trait]
impl SessionSink for PgStore {
    async fn open_session(
        &self,
        user_id: UserId,
        device: &DeviceInfo,
        location: &Location,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO user_sessions (id, user_id, device_info, location, is_online, session_start, last_active)
               VALUES ($1, $2, $3, $4, true, $5, $5)"#,
        )
        .bind(id)
        .bind(user_id)
        .bind(Json(device))
        .bind(Json(location))
        .bind(at)
        .execute(&self.pool)
        .await
        .context("failed to open user session")?;
        Ok(id)
    }

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(r#"UPDATE user_sessions SET last_active = $2, is_online = true WHERE id = $1"#)
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("failed to touch user session")?;
        Ok(())
    }

    async fn close_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(r#"UPDATE user_sessions SET last_active = $2, is_online = false WHERE id = $1"#)
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("failed to close user session")?;
        Ok(())
    }
}
