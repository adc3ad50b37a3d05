//! Credential manager - one upstream authentication session
//!
//! Owns a refresh token and the access token derived from it. Access
//! tokens are cached with their expiry; refresh happens lazily under the
//! per-manager mutex so concurrent callers wait on a single in-flight
//! refresh instead of stampeding the refresh endpoint.
//!
//! Two credential modes exist upstream:
//! - `social`: refresh with the bare refresh token
//! - `idc`: OAuth refresh with a client id/secret pair

pub mod cache;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::util::mask_token;

/// Refresh this long before the recorded expiry.
const REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;
/// Absolute timeout on refresh HTTP calls.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
/// Expiry assumed when the refresh response omits `expiresIn`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Upstream credential mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Social,
    Idc,
}

impl AuthType {
    pub fn parse(s: &str) -> Self {
        match s {
            "idc" => AuthType::Idc,
            _ => AuthType::Social,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Social => "social",
            AuthType::Idc => "idc",
        }
    }
}

/// Cached access token with bookkeeping.
#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at_ms: i64,
    profile_arn: Option<String>,
}

impl TokenState {
    fn valid_at(&self, now_ms: i64) -> bool {
        self.access_token.is_some() && now_ms + REFRESH_MARGIN_MS < self.expires_at_ms
    }
}

/// Subscription metadata reported by the upstream usage endpoint.
#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    pub subscription_tier: Option<String>,
    pub usage_percent: Option<f64>,
}

/// One upstream authentication session.
pub struct CredentialManager {
    refresh_token: String,
    region: String,
    auth_type: AuthType,
    client_id: Option<String>,
    client_secret: Option<String>,
    api_host: String,
    q_host: String,
    http: reqwest::Client,
    state: Mutex<TokenState>,
}

impl CredentialManager {
    pub fn new(
        refresh_token: String,
        region: String,
        auth_type: AuthType,
        client_id: Option<String>,
        client_secret: Option<String>,
        profile_arn: Option<String>,
    ) -> Self {
        let api_host = format!("https://codewhisperer.{}.amazonaws.com", region);
        let q_host = format!("https://q.{}.amazonaws.com", region);
        let http = reqwest::Client::builder()
            .timeout(REFRESH_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            refresh_token,
            region,
            auth_type,
            client_id,
            client_secret,
            api_host,
            q_host,
            http,
            state: Mutex::new(TokenState {
                profile_arn,
                ..Default::default()
            }),
        }
    }

    /// Host serving generateAssistantResponse for this region.
    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    /// Host serving account/usage queries for this region.
    pub fn q_host(&self) -> &str {
        &self.q_host
    }

    /// Profile ARN recorded from the most recent refresh, if any.
    pub async fn profile_arn(&self) -> Option<String> {
        self.state.lock().await.profile_arn.clone()
    }

    /// Return a valid access token, refreshing if the cached one is
    /// missing or inside the refresh margin. Callers for the same
    /// manager serialize here.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let now_ms = chrono::Utc::now().timestamp_millis();

        if state.valid_at(now_ms) {
            if let Some(token) = &state.access_token {
                return Ok(token.clone());
            }
        }

        tracing::debug!(
            "Refreshing access token for {} ({}, {})",
            mask_token(&self.refresh_token),
            self.auth_type.as_str(),
            self.region
        );

        let refreshed = self.refresh().await?;

        state.access_token = Some(refreshed.access_token.clone());
        state.expires_at_ms = now_ms
            + refreshed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) * 1000;
        if let Some(arn) = refreshed.profile_arn {
            state.profile_arn = Some(arn);
        }

        Ok(refreshed.access_token)
    }

    /// Execute the refresh flow for this credential mode.
    async fn refresh(&self) -> Result<RefreshedTokens> {
        let (url, body) = match self.auth_type {
            AuthType::Social => (
                format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", self.region),
                serde_json::json!({ "refreshToken": self.refresh_token }),
            ),
            AuthType::Idc => (
                format!("https://oidc.{}.amazonaws.com/token", self.region),
                serde_json::json!({
                    "clientId": self.client_id.as_deref().unwrap_or_default(),
                    "clientSecret": self.client_secret.as_deref().unwrap_or_default(),
                    "grantType": "refresh_token",
                    "refreshToken": self.refresh_token,
                }),
            ),
        };

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Refresh request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Token refresh failed for {}: HTTP {} - {}",
                mask_token(&self.refresh_token),
                status,
                crate::util::truncate_utf8_safe(&text, 500)
            );
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RefreshResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
            #[serde(default)]
            expires_in: Option<i64>,
            #[serde(default)]
            profile_arn: Option<String>,
        }

        let tokens: RefreshResponse = resp.json().await.context("Invalid refresh response")?;

        if let Some(rotated) = &tokens.refresh_token {
            if rotated != &self.refresh_token {
                // The caller decides whether to persist the rotation
                tracing::info!(
                    "Upstream rotated refresh token for {}",
                    mask_token(&self.refresh_token)
                );
            }
        }

        Ok(RefreshedTokens {
            access_token: tokens.access_token,
            expires_in: tokens.expires_in,
            profile_arn: tokens.profile_arn,
        })
    }

    /// Query subscription tier and usage from the upstream usage endpoint.
    pub async fn fetch_account_info(&self) -> Result<AccountInfo> {
        let access_token = self.get_access_token().await?;
        let url = format!("{}/getUsageLimits", self.q_host);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("Usage query failed")?;

        if !resp.status().is_success() {
            bail!("Usage query returned HTTP {}", resp.status());
        }

        let body: serde_json::Value = resp.json().await.context("Invalid usage response")?;
        Ok(AccountInfo {
            subscription_tier: body
                .get("subscriptionTier")
                .and_then(|v| v.as_str())
                .map(String::from),
            usage_percent: body
                .get("usagePercentage")
                .or_else(|| body.get("usagePercent"))
                .and_then(|v| v.as_f64()),
        })
    }
}

struct RefreshedTokens {
    access_token: String,
    expires_in: Option<i64>,
    profile_arn: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(auth_type: AuthType, region: &str) -> CredentialManager {
        CredentialManager::new(
            "refresh-token-abcdef".to_string(),
            region.to_string(),
            auth_type,
            None,
            None,
            None,
        )
    }

    #[test]
    fn test_hosts_derived_from_region() {
        let m = manager(AuthType::Social, "us-east-1");
        assert_eq!(m.api_host(), "https://codewhisperer.us-east-1.amazonaws.com");
        assert_eq!(m.q_host(), "https://q.us-east-1.amazonaws.com");

        let eu = manager(AuthType::Social, "eu-west-1");
        assert_eq!(eu.api_host(), "https://codewhisperer.eu-west-1.amazonaws.com");
    }

    #[test]
    fn test_auth_type_parse() {
        assert_eq!(AuthType::parse("idc"), AuthType::Idc);
        assert_eq!(AuthType::parse("social"), AuthType::Social);
        assert_eq!(AuthType::parse("anything"), AuthType::Social);
    }

    #[test]
    fn test_token_state_validity_margin() {
        let mut state = TokenState::default();
        assert!(!state.valid_at(0));

        state.access_token = Some("tok".to_string());
        state.expires_at_ms = 10 * 60 * 1000;

        // 10 minutes to expiry: valid (margin is 5 minutes)
        assert!(state.valid_at(0));
        // 4 minutes to expiry: inside the margin, refresh needed
        assert!(!state.valid_at(6 * 60 * 1000 + 1));
    }

    #[tokio::test]
    async fn test_initial_profile_arn_retained() {
        let m = CredentialManager::new(
            "tok".to_string(),
            "us-east-1".to_string(),
            AuthType::Social,
            None,
            None,
            Some("arn:aws:profile/x".to_string()),
        );
        assert_eq!(m.profile_arn().await.as_deref(), Some("arn:aws:profile/x"));
    }
}
