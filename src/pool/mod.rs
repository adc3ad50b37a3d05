//! Token-pool allocator
//!
//! Picks a credential (or an external API account) for each request.
//! Credentials are scored on success rate, cooldown since last use, and
//! short-window load, then drawn weighted-random: high scorers are
//! preferred, not forced, so load spreads across the pool.

pub mod health;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::sync::Mutex;

use crate::auth::cache::{ManagerCache, ManagerKeyParams};
use crate::auth::{AuthType, CredentialManager};
use crate::config::{requires_pro_plus, Config};
use crate::error::GatewayError;
use crate::store::{Credential, CredentialStatus, ExternalApiAccount, Store};

/// Window for the short-term load component.
const RECENT_USAGE_WINDOW_SECS: u64 = 60;

/// The allocator's pick for one request.
pub enum Allocation {
    Credential {
        credential: Credential,
        manager: Arc<CredentialManager>,
    },
    External(ExternalApiAccount),
}

struct RecentUsage {
    counts: HashMap<i64, u32>,
    last_reset: Instant,
}

pub struct Allocator {
    store: Store,
    managers: ManagerCache,
    recent: Mutex<RecentUsage>,
    min_success_rate: f64,
    profile_arn: Option<String>,
    default_region: String,
    self_use: bool,
}

impl Allocator {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            managers: ManagerCache::new(config.auth_manager_cache_max_size),
            recent: Mutex::new(RecentUsage {
                counts: HashMap::new(),
                last_reset: Instant::now(),
            }),
            min_success_rate: config.token_min_success_rate,
            profile_arn: config.profile_arn.clone(),
            default_region: config.region.clone(),
            self_use: config.self_use,
        }
    }

    /// Choose a credential or external account for this request.
    pub async fn allocate(
        &self,
        user_id: Option<i64>,
        model: &str,
    ) -> Result<Allocation, GatewayError> {
        let pro_plus = requires_pro_plus(model);

        if let Some(user_id) = user_id {
            if let Some(allocation) = self.allocate_for_user(user_id, model, pro_plus).await? {
                return Ok(allocation);
            }
        }

        if self.self_use {
            return Err(GatewayError::NoTokenAvailable(
                "no available token".to_string(),
            ));
        }

        self.allocate_from_public_pool(model, pro_plus).await
    }

    /// User path: the user's private credentials plus their external
    /// accounts, drawn uniformly. Pro+ models restrict the credential
    /// side to opus-enabled entries first.
    async fn allocate_for_user(
        &self,
        user_id: i64,
        model: &str,
        pro_plus: bool,
    ) -> Result<Option<Allocation>, GatewayError> {
        let credentials = self
            .store
            .get_user_credentials(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let mut active: Vec<Credential> = credentials
            .into_iter()
            .filter(|c| {
                c.status == CredentialStatus::Active
                    && (!self.self_use || c.visibility == "private")
            })
            .collect();

        if pro_plus {
            let pro: Vec<Credential> =
                active.iter().filter(|c| c.opus_enabled).cloned().collect();
            if !pro.is_empty() {
                active = pro;
            } else if !active.is_empty() {
                tracing::warn!(
                    "User {} has no Pro+ credential for {}, using normal credentials",
                    user_id,
                    model
                );
            }
        }

        let externals: Vec<ExternalApiAccount> = self
            .store
            .get_user_external_accounts(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .into_iter()
            .filter(|a| a.allows_model(model))
            .collect();

        let total = active.len() + externals.len();
        if total == 0 {
            return Ok(None);
        }

        // Uniform draw across the combined candidate set
        let pick = rand::thread_rng().gen_range(0..total);
        if pick < active.len() {
            let credential = active.swap_remove(pick);
            tracing::info!(
                "Allocated credential {} for user {} ({} candidates)",
                credential.id,
                user_id,
                total
            );
            self.record_recent_usage(credential.id).await;
            let manager = self.manager_for(&credential).await?;
            return Ok(Some(Allocation::Credential { credential, manager }));
        }
        match externals.into_iter().nth(pick - active.len()) {
            Some(account) => {
                tracing::info!(
                    "Allocated external account {} ({}) for user {}",
                    account.id,
                    account.name,
                    user_id
                );
                Ok(Some(Allocation::External(account)))
            }
            None => Ok(None),
        }
    }

    /// Anonymous path: weighted draw over the public pool.
    async fn allocate_from_public_pool(
        &self,
        model: &str,
        pro_plus: bool,
    ) -> Result<Allocation, GatewayError> {
        let public = self
            .store
            .get_public_credentials()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if public.is_empty() {
            return Err(GatewayError::NoTokenAvailable(
                "no available token".to_string(),
            ));
        }

        // Screen out poor performers, but give new credentials a chance
        let mut good: Vec<Credential> = public
            .iter()
            .filter(|c| {
                c.success_rate() >= self.min_success_rate
                    || (c.success_count + c.fail_count) < 10
            })
            .cloned()
            .collect();
        if good.is_empty() {
            good = public;
        }

        if pro_plus {
            let pro: Vec<Credential> = good.iter().filter(|c| c.opus_enabled).cloned().collect();
            if !pro.is_empty() {
                good = pro;
            } else {
                tracing::warn!("Public pool has no Pro+ credential for {}", model);
            }
        }

        let credential = self.weighted_choice(good).await;
        tracing::info!("Allocated public credential {}", credential.id);
        self.record_recent_usage(credential.id).await;
        let manager = self.manager_for(&credential).await?;
        Ok(Allocation::Credential { credential, manager })
    }

    /// Weighted random draw; scores are shifted positive before sampling.
    async fn weighted_choice(&self, mut candidates: Vec<Credential>) -> Credential {
        if candidates.len() == 1 {
            return candidates.remove(0);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let recent = self.recent_counts().await;
        let mut scored: Vec<(Credential, f64)> = candidates
            .into_iter()
            .map(|c| {
                let count = recent.get(&c.id).copied().unwrap_or(0);
                let score = score_credential(&c, now_ms, count, self.min_success_rate);
                (c, score)
            })
            .collect();

        let min_score = scored
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::INFINITY, f64::min);
        if min_score <= 0.0 {
            for (_, score) in &mut scored {
                *score = *score - min_score + 1.0;
            }
        }

        let total: f64 = scored.iter().map(|(_, s)| *s).sum();
        let mut draw = rand::thread_rng().gen_range(0.0..total);
        let last = scored.len() - 1;
        for (index, (credential, score)) in scored.into_iter().enumerate() {
            draw -= score;
            if draw <= 0.0 || index == last {
                return credential;
            }
        }
        unreachable!("weighted draw always selects a candidate")
    }

    async fn manager_for(
        &self,
        credential: &Credential,
    ) -> Result<Arc<CredentialManager>, GatewayError> {
        let secrets = self
            .store
            .get_credential_secrets(credential.id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let region = if credential.region.is_empty() {
            self.default_region.clone()
        } else {
            credential.region.clone()
        };
        Ok(self
            .managers
            .get_or_create(ManagerKeyParams {
                refresh_token: secrets.refresh_token,
                region,
                auth_type: AuthType::parse(&credential.auth_type),
                client_id: secrets.client_id,
                client_secret: secrets.client_secret,
                profile_arn: self.profile_arn.clone(),
            })
            .await)
    }

    /// Record the outcome of a request served by a credential.
    pub fn record_outcome(&self, credential_id: i64, success: bool) {
        if let Err(e) = self.store.record_credential_usage(credential_id, success) {
            tracing::error!("Failed to record credential usage: {}", e);
        }
    }

    /// Quota exhausted: the credential is done for the month.
    pub async fn mark_expired(&self, credential: &Credential) {
        self.evict_manager(credential).await;
        match self
            .store
            .set_credential_status(credential.id, CredentialStatus::Expired)
        {
            Ok(true) => tracing::warn!("Credential {} marked expired (quota)", credential.id),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to mark credential expired: {}", e),
        }
    }

    /// Refresh rejection: the credential no longer authenticates.
    pub async fn mark_invalid(&self, credential: &Credential) {
        self.evict_manager(credential).await;
        match self
            .store
            .set_credential_status(credential.id, CredentialStatus::Invalid)
        {
            Ok(true) => tracing::warn!("Credential {} marked invalid", credential.id),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to mark credential invalid: {}", e),
        }
    }

    /// A dead credential's cached manager must not serve further
    /// requests from a stale access token.
    async fn evict_manager(&self, credential: &Credential) {
        if let Ok(secrets) = self.store.get_credential_secrets(credential.id) {
            self.managers
                .remove(&secrets.refresh_token, &credential.region)
                .await;
        }
    }

    async fn record_recent_usage(&self, credential_id: i64) {
        let mut recent = self.recent.lock().await;
        if recent.last_reset.elapsed().as_secs() > RECENT_USAGE_WINDOW_SECS {
            recent.counts.clear();
            recent.last_reset = Instant::now();
        }
        *recent.counts.entry(credential_id).or_insert(0) += 1;
    }

    async fn recent_counts(&self) -> HashMap<i64, u32> {
        let mut recent = self.recent.lock().await;
        if recent.last_reset.elapsed().as_secs() > RECENT_USAGE_WINDOW_SECS {
            recent.counts.clear();
            recent.last_reset = Instant::now();
        }
        recent.counts.clone()
    }
}

/// Score a credential 0-100.
///
/// - success rate, weight 40 (heavy ×20 penalty under the threshold once
///   the sample is meaningful)
/// - cooldown since last use, weight 30 (recent use scores low, forcing
///   rotation)
/// - short-window load, weight 30 (each use in the last minute costs 10)
fn score_credential(
    credential: &Credential,
    now_ms: i64,
    recent_count: u32,
    min_success_rate: f64,
) -> f64 {
    let total = credential.success_count + credential.fail_count;
    let success_rate = credential.success_rate();
    let base_score = if success_rate < min_success_rate && total > 10 {
        success_rate * 20.0
    } else {
        success_rate * 40.0
    };

    let seconds_since_use = credential
        .last_used_ms
        .map(|used| ((now_ms - used).max(0) / 1000) as u64)
        .unwrap_or(3600);
    let cooldown_score = if seconds_since_use < 30 {
        5.0
    } else if seconds_since_use < 60 {
        15.0
    } else if seconds_since_use < 300 {
        25.0
    } else {
        30.0
    };

    let balance_score = (30.0 - 10.0 * recent_count as f64).max(0.0);

    base_score + cooldown_score + balance_score
}
