use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::persist::store::{DocumentStore, UserPublicKey};

/// Read-through public-key lookup with an optional TTL cache. The cache is
/// strictly an optimization: entries expire on the TTL so a key rotation is
/// never masked for longer, and absent keys are never cached.
pub struct KeyService {
    store: Arc<dyn DocumentStore>,
    cache: Option<KeyCache>,
}

struct KeyCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, UserPublicKey)>>,
}

impl KeyService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store, cache: None }
    }

    pub fn with_cache(store: Arc<dyn DocumentStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: Some(KeyCache {
                ttl,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn lookup(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPublicKey>, GatewayError> {
        if let Some(cache) = &self.cache {
            let entries = cache.entries.lock().await;
            if let Some((cached_at, key)) = entries.get(user_id)
                && cached_at.elapsed() < cache.ttl
            {
                return Ok(Some(key.clone()));
            }
        }

        let key = self.store.get_account_key(user_id).await?;

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            cache
                .entries
                .lock()
                .await
                .insert(user_id.to_string(), (Instant::now(), key.clone()));
        }
        Ok(key)
    }
}
