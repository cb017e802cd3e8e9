use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::redis_store::RedisStore;
use crate::store::StoreError;

/// A process-wide handle to the Redis store that connects on first use.
///
/// The connection is established at most once; every later `get` hands out the same store.
/// A failed attempt leaves the handle empty so the next caller tries again.
pub struct SharedStore {
    url: String,
    store: OnceCell<Arc<RedisStore>>,
}

impl SharedStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            store: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.store.initialized()
    }

    pub async fn get(&self) -> Result<Arc<RedisStore>, StoreError> {
        let store = self
            .store
            .get_or_try_init(|| async {
                info!(url = %self.url, "connecting to redis");
                RedisStore::new(&self.url).await.map(Arc::new)
            })
            .await?;

        Ok(store.clone())
    }
}
