//! LRU cache of credential managers
//!
//! Managers are shared across requests and keyed by
//! `(refresh_token, region)` so the same token used in two regions gets
//! two sessions. Eviction is LRU-first once the configured cap is hit.
//! Credential status changes remove nothing here; the allocator's
//! filtering does that work.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

use super::{AuthType, CredentialManager};
use crate::util::mask_token;

/// Parameters identifying one upstream session.
#[derive(Debug, Clone)]
pub struct ManagerKeyParams {
    pub refresh_token: String,
    pub region: String,
    pub auth_type: AuthType,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub profile_arn: Option<String>,
}

pub struct ManagerCache {
    cache: Mutex<LruCache<(String, String), Arc<CredentialManager>>>,
}

impl ManagerCache {
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap();
        tracing::info!("AuthManager cache initialized with max_size={}", max_size);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get the cached manager for a credential, creating one on miss.
    pub async fn get_or_create(&self, params: ManagerKeyParams) -> Arc<CredentialManager> {
        let key = (params.refresh_token.clone(), params.region.clone());
        let mut cache = self.cache.lock().await;

        if let Some(manager) = cache.get(&key) {
            tracing::debug!(
                "AuthManager cache hit for {} ({})",
                mask_token(&params.refresh_token),
                params.region
            );
            return manager.clone();
        }

        tracing::info!(
            "Creating AuthManager for {} ({})",
            mask_token(&params.refresh_token),
            params.region
        );
        let manager = Arc::new(CredentialManager::new(
            params.refresh_token,
            params.region,
            params.auth_type,
            params.client_id,
            params.client_secret,
            params.profile_arn,
        ));

        if let Some((evicted_key, _)) = cache.push(key, manager.clone()) {
            tracing::info!(
                "AuthManager cache full, evicted {} ({})",
                mask_token(&evicted_key.0),
                evicted_key.1
            );
        }

        manager
    }

    /// Drop the manager for one credential (e.g. after rotation).
    pub async fn remove(&self, refresh_token: &str, region: &str) -> bool {
        let mut cache = self.cache.lock().await;
        cache
            .pop(&(refresh_token.to_string(), region.to_string()))
            .is_some()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(token: &str, region: &str) -> ManagerKeyParams {
        ManagerKeyParams {
            refresh_token: token.to_string(),
            region: region.to_string(),
            auth_type: AuthType::Social,
            client_id: None,
            client_secret: None,
            profile_arn: None,
        }
    }

    #[tokio::test]
    async fn test_same_key_returns_same_manager() {
        let cache = ManagerCache::new(10);
        let a = cache.get_or_create(params("tok-1", "us-east-1")).await;
        let b = cache.get_or_create(params("tok-1", "us-east-1")).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_region_distinguishes_entries() {
        let cache = ManagerCache::new(10);
        let a = cache.get_or_create(params("tok-1", "us-east-1")).await;
        let b = cache.get_or_create(params("tok-1", "eu-west-1")).await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = ManagerCache::new(2);
        let first = cache.get_or_create(params("tok-1", "r")).await;
        cache.get_or_create(params("tok-2", "r")).await;

        // Touch tok-1 so tok-2 is the eviction candidate
        let touched = cache.get_or_create(params("tok-1", "r")).await;
        assert!(Arc::ptr_eq(&first, &touched));

        cache.get_or_create(params("tok-3", "r")).await;
        assert_eq!(cache.len().await, 2);

        // tok-1 survived; tok-2 was evicted and is recreated fresh
        let again = cache.get_or_create(params("tok-1", "r")).await;
        assert!(Arc::ptr_eq(&first, &again));
        let recreated = cache.get_or_create(params("tok-2", "r")).await;
        assert!(!Arc::ptr_eq(&first, &recreated));
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = ManagerCache::new(4);
        cache.get_or_create(params("tok-1", "r")).await;
        assert!(cache.remove("tok-1", "r").await);
        assert!(!cache.remove("tok-1", "r").await);
        assert_eq!(cache.len().await, 0);
    }
}
