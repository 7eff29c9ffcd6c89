use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{CacheError, CacheFuture, CodeCache};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process TTL cache. Expiry is evaluated lazily against the injected clock.
pub struct MemoryCodeCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCodeCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    fn expiry(&self, ttl: Duration) -> Result<DateTime<Utc>, CacheError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|error| CacheError::Unexpected(format!("ttl out of range: {error}")))?;
        Ok(self.clock.now() + ttl)
    }

    fn live_entry<'m>(
        &self,
        entries: &'m mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'m mut Entry> {
        let now = self.clock.now();
        if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl Default for MemoryCodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCache for MemoryCodeCache {
    fn set_with_ttl<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = self.expiry(ttl)?;
            self.entries
                .lock()
                .await
                .insert(key.to_string(), Entry { value: value.to_string(), expires_at });
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            Ok(self.live_entry(&mut entries, key).map(|entry| entry.value.clone()))
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if self.live_entry(&mut entries, key).is_some() {
                return Ok(false);
            }

            let expires_at = self.expiry(ttl)?;
            entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at });
            Ok(true)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }

    fn take<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            let live = self.live_entry(&mut entries, key).is_some();
            Ok(if live { entries.remove(key).map(|entry| entry.value) } else { None })
        })
    }

    fn increment<'a>(&'a self, key: &'a str, ttl_on_create: Duration) -> CacheFuture<'a, i64> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = self.live_entry(&mut entries, key) {
                let next = entry.value.parse::<i64>().map_err(|_| {
                    CacheError::Unexpected(format!("value under '{key}' is not an integer"))
                })? + 1;
                entry.value = next.to_string();
                return Ok(next);
            }

            let expires_at = self.expiry(ttl_on_create)?;
            entries.insert(key.to_string(), Entry { value: "1".to_string(), expires_at });
            Ok(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;

    use super::MemoryCodeCache;
    use crate::{
        cache::CodeCache,
        clock::{Clock, ManualClock},
    };

    fn cache_with_clock() -> (MemoryCodeCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (MemoryCodeCache::with_clock(clock.clone() as Arc<dyn Clock>), clock)
    }

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let (cache, clock) = cache_with_clock();
        cache
            .set_with_ttl("verify:a@x.com", "123456", Duration::from_secs(600))
            .await
            .expect("set should succeed");

        clock.advance(chrono::Duration::seconds(599));
        assert_eq!(cache.get("verify:a@x.com").await.expect("get").as_deref(), Some("123456"));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(cache.get("verify:a@x.com").await.expect("get"), None);
    }

    #[tokio::test]
    async fn take_returns_value_once() {
        let (cache, _clock) = cache_with_clock();
        cache.set_with_ttl("k", "v", Duration::from_secs(60)).await.expect("set");

        assert_eq!(cache.take("k").await.expect("take").as_deref(), Some("v"));
        assert_eq!(cache.take("k").await.expect("take"), None);
    }

    #[tokio::test]
    async fn set_overwrites_previous_value() {
        let (cache, _clock) = cache_with_clock();
        cache.set_with_ttl("k", "old", Duration::from_secs(60)).await.expect("set");
        cache.set_with_ttl("k", "new", Duration::from_secs(60)).await.expect("set");

        assert_eq!(cache.get("k").await.expect("get").as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn increment_keeps_ttl_from_first_call() {
        let (cache, clock) = cache_with_clock();
        let window = Duration::from_secs(3600);

        assert_eq!(cache.increment("n", window).await.expect("incr"), 1);
        clock.advance(chrono::Duration::seconds(3000));
        assert_eq!(cache.increment("n", window).await.expect("incr"), 2);

        clock.advance(chrono::Duration::seconds(600));
        assert_eq!(cache.get("n").await.expect("get"), None);
        assert_eq!(cache.increment("n", window).await.expect("incr"), 1);
    }

    #[tokio::test]
    async fn set_if_absent_only_creates_once_per_ttl() {
        let (cache, clock) = cache_with_clock();
        let ttl = Duration::from_secs(60);

        assert!(cache.set_if_absent("flag", "1", ttl).await.expect("first set"));
        assert!(!cache.set_if_absent("flag", "2", ttl).await.expect("second set"));
        assert_eq!(cache.get("flag").await.expect("get").as_deref(), Some("1"));

        clock.advance(chrono::Duration::seconds(60));
        assert!(cache.set_if_absent("flag", "3", ttl).await.expect("set after expiry"));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let (cache, _clock) = cache_with_clock();
        cache.set_with_ttl("k", "v", Duration::from_secs(60)).await.expect("set");
        cache.delete("k").await.expect("delete");
        cache.delete("k").await.expect("deleting a missing key is not an error");

        assert_eq!(cache.get("k").await.expect("get"), None);
    }
}
