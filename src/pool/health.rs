//! Background credential health checks
//!
//! A periodic sweep over every active credential: refresh its access
//! token, record the result, and mark credentials that no longer
//! authenticate as invalid so the allocator stops handing them out.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::auth::{AuthType, CredentialManager};
use crate::store::{CredentialStatus, Store};
use crate::util::truncate_utf8_safe;

/// Pause between consecutive checks to avoid upstream rate limiting.
const PER_CHECK_DELAY: Duration = Duration::from_secs(1);
/// Stored error messages are capped at this many bytes.
const MAX_ERROR_LEN: usize = 200;

/// Outcome counts for one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
}

pub struct HealthChecker {
    store: Store,
    interval: Duration,
    default_region: String,
    profile_arn: Option<String>,
}

impl HealthChecker {
    pub fn new(
        store: Store,
        interval: Duration,
        default_region: String,
        profile_arn: Option<String>,
    ) -> Self {
        Self {
            store,
            interval,
            default_region,
            profile_arn,
        }
    }

    /// Spawn the background loop. Abort the returned handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        tracing::info!(
            "Token health checker started (interval: {}s)",
            self.interval.as_secs()
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                let summary = self.check_all().await;
                tracing::info!(
                    "Health check complete: {} valid, {} invalid",
                    summary.valid,
                    summary.invalid
                );
            }
        })
    }

    /// Check every active credential once.
    pub async fn check_all(&self) -> HealthSummary {
        let credentials = match self.store.get_all_active_credentials() {
            Ok(creds) => creds,
            Err(e) => {
                tracing::error!("Health check could not list credentials: {}", e);
                return HealthSummary::default();
            }
        };

        if credentials.is_empty() {
            tracing::debug!("No active credentials to check");
            return HealthSummary::default();
        }

        tracing::info!("Starting health check for {} credentials", credentials.len());

        let mut summary = HealthSummary {
            checked: credentials.len(),
            ..Default::default()
        };

        for credential in credentials {
            match self.check_credential(credential.id, &credential.region, &credential.auth_type).await
            {
                Ok(manager) => {
                    summary.valid += 1;
                    let _ = self.store.record_health_check(credential.id, true, None);
                    // Refresh cached subscription metadata while the
                    // access token is warm
                    match manager.fetch_account_info().await {
                        Ok(info) => {
                            let _ = self.store.update_account_metadata(
                                credential.id,
                                info.subscription_tier.as_deref(),
                                info.usage_percent,
                            );
                        }
                        Err(e) => {
                            tracing::debug!(
                                "Account info unavailable for credential {}: {}",
                                credential.id,
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    summary.invalid += 1;
                    let message = e.to_string();
                    let truncated = truncate_utf8_safe(&message, MAX_ERROR_LEN);
                    let _ = self
                        .store
                        .record_health_check(credential.id, false, Some(truncated));
                    if let Err(e) = self
                        .store
                        .set_credential_status(credential.id, CredentialStatus::Invalid)
                    {
                        tracing::error!("Failed to mark credential invalid: {}", e);
                    } else {
                        tracing::warn!("Credential {} marked invalid: {}", credential.id, truncated);
                    }
                }
            }
            tokio::time::sleep(PER_CHECK_DELAY).await;
        }

        summary
    }

    async fn check_credential(
        &self,
        id: i64,
        region: &str,
        auth_type: &str,
    ) -> anyhow::Result<CredentialManager> {
        let secrets = self.store.get_credential_secrets(id)?;
        let region = if region.is_empty() {
            self.default_region.clone()
        } else {
            region.to_string()
        };

        // A fresh manager per check: the cached one may hold a token
        // that outlives a revoked refresh token.
        let manager = CredentialManager::new(
            secrets.refresh_token,
            region,
            AuthType::parse(auth_type),
            secrets.client_id,
            secrets.client_secret,
            self.profile_arn.clone(),
        );
        manager.get_access_token().await?;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_store_sweep() {
        let store = Store::open_in_memory().unwrap();
        let checker = HealthChecker::new(
            store,
            Duration::from_secs(600),
            "us-east-1".to_string(),
            None,
        );
        let summary = checker.check_all().await;
        assert_eq!(summary, HealthSummary::default());
    }

    #[tokio::test]
    async fn test_inactive_credentials_skipped() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_credential(1, "tok", "social", "us-east-1", None, None, "private", false)
            .unwrap();
        store
            .set_credential_status(id, CredentialStatus::Expired)
            .unwrap();

        let checker = HealthChecker::new(
            store,
            Duration::from_secs(600),
            "us-east-1".to_string(),
            None,
        );
        let summary = checker.check_all().await;
        assert_eq!(summary.checked, 0);
    }
}
