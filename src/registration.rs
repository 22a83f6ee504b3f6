//! Profile creation after a sign-up with the identity provider.

use anyhow::Result;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use tracing::{info, warn};

use crate::store::ReferralStore;
use crate::types::{NewProfile, Profile, UserId};

pub const REFERRAL_CODE_LEN: usize = 6;
const MAX_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct NewRegistration {
    /// The user id issued by the identity provider.
    pub id: UserId,
    pub email: String,
    pub full_name: Option<String>,
    /// Referral code the user signed up with, if any.
    pub referral_code: Option<String>,
}

#[derive(Debug)]
pub enum RegistrationOutcome {
    Created(Profile),
    /// The id or email is already registered.
    Conflict,
}

/// A random upper-case alphanumeric referral code.
pub fn generate_referral_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..REFERRAL_CODE_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_uppercase())
        .collect()
}

/// Creates the profile for `registration`, linking it to the owner of the
/// referral code it was made with.
///
/// An unknown referral code is not an error: the profile is created without
/// a referrer.
pub async fn register_profile(
    store: &dyn ReferralStore,
    registration: NewRegistration,
) -> Result<RegistrationOutcome> {
    let referred_by = match registration
        .referral_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        Some(code) => {
            let referrer = store.profile_by_referral_code(code).await?;
            if referrer.is_none() {
                warn!(code, "registration with unknown referral code");
            }
            referrer.map(|p| p.id)
        }
        None => None,
    };

    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = generate_referral_code(&mut rand::thread_rng());
        let profile = NewProfile {
            id: registration.id,
            email: registration.email.clone(),
            full_name: registration.full_name.clone(),
            referral_code: code,
            referred_by,
        };
        if let Some(created) = store.insert_profile(&profile).await? {
            info!(user = %created.id, referred_by = ?created.referred_by, "profile registered");
            return Ok(RegistrationOutcome::Created(created));
        }
        // only a referral code collision is worth another attempt
        if store.profile(registration.id).await?.is_some()
            || store.profile_by_email(&registration.email).await?.is_some()
        {
            return Ok(RegistrationOutcome::Conflict);
        }
    }
    Ok(RegistrationOutcome::Conflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn registration(email: &str, code: Option<&str>) -> NewRegistration {
        NewRegistration {
            id: Uuid::new_v4(),
            email: email.into(),
            full_name: Some("Awa Diop".into()),
            referral_code: code.map(Into::into),
        }
    }

    #[test]
    fn codes_are_short_and_upper_case() {
        let code = generate_referral_code(&mut rand::thread_rng());
        assert_eq!(code.len(), REFERRAL_CODE_LEN);
        assert!(code.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn links_to_referrer_by_code() {
        let store = MemoryStore::new();
        let referrer = Profile {
            id: Uuid::new_v4(),
            email: "referrer@example.com".into(),
            full_name: None,
            referral_code: Some("ABC123".into()),
            referred_by: None,
            created_at: Utc::now(),
        };
        store.add_profile(referrer.clone());

        let RegistrationOutcome::Created(p) = register_profile(&store, registration("a@example.com", Some(" ABC123 ")))
            .await
            .unwrap()
        else {
            panic!("expected a new profile");
        };
        assert_eq!(p.referred_by, Some(referrer.id));
        assert_eq!(p.referral_code.as_deref().map(str::len), Some(REFERRAL_CODE_LEN));

        let RegistrationOutcome::Created(p) = register_profile(&store, registration("b@example.com", Some("NOPE00")))
            .await
            .unwrap()
        else {
            panic!("expected a new profile");
        };
        assert_eq!(p.referred_by, None);
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = MemoryStore::new();
        assert!(matches!(
            register_profile(&store, registration("dup@example.com", None)).await.unwrap(),
            RegistrationOutcome::Created(_)
        ));
        assert_eq!(store.profile_insert_count(), 1);
        assert!(matches!(
            register_profile(&store, registration("dup@example.com", None)).await.unwrap(),
            RegistrationOutcome::Conflict
        ));
        assert_eq!(store.profile_insert_count(), 2);
    }
}
