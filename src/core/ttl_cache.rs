use std::future::Future;
use std::time::{Duration, Instant};

/// A single cached value with an expiry instant.
///
/// Time is always passed in by the caller, which keeps expiry decisions
/// deterministic and testable.
#[derive(Debug)]
pub(crate) struct TtlCache<T> {
    ttl: Duration,
    entry: Option<(T, Instant)>,
}

impl<T: Clone> TtlCache<T> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    pub(crate) fn get(&self, now: Instant) -> Option<&T> {
        match &self.entry {
            Some((value, expires_at)) if now < *expires_at => Some(value),
            _ => None,
        }
    }

    pub(crate) fn store(&mut self, value: T, now: Instant) {
        self.entry = Some((value, now + self.ttl));
    }

    /// Returns the cached value while fresh, otherwise runs `refresh` and caches its result.
    /// Errors are passed through and leave the previous entry untouched.
    pub(crate) async fn get_or_refresh<F, Fut, E>(
        &mut self,
        now: Instant,
        force: bool,
        refresh: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !force {
            if let Some(value) = self.get(now) {
                return Ok(value.clone());
            }
        }
        let value = refresh().await?;
        self.store(value.clone(), now);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn serves_cached_value_until_expiry() {
        let mut cache = TtlCache::new(Duration::from_secs(300));
        let counter = Cell::new(0);
        let calls = &counter;
        let start = Instant::now();

        let fetch = move || async move {
            calls.set(calls.get() + 1);
            Ok::<_, ()>(calls.get())
        };

        assert_eq!(cache.get_or_refresh(start, false, fetch).await, Ok(1));
        assert_eq!(
            cache
                .get_or_refresh(start + Duration::from_secs(299), false, fetch)
                .await,
            Ok(1)
        );
        assert_eq!(
            cache
                .get_or_refresh(start + Duration::from_secs(300), false, fetch)
                .await,
            Ok(2)
        );
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn force_bypasses_fresh_entry() {
        let mut cache = TtlCache::new(Duration::from_secs(300));
        let now = Instant::now();
        cache.store("old", now);

        let value = cache
            .get_or_refresh(now, true, || async { Ok::<_, ()>("new") })
            .await;
        assert_eq!(value, Ok("new"));
        assert_eq!(cache.get(now), Some(&"new"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entry() {
        let mut cache = TtlCache::new(Duration::from_secs(10));
        let now = Instant::now();
        cache.store(7, now);

        let later = now + Duration::from_secs(20);
        let result = cache
            .get_or_refresh(later, false, || async { Err::<i32, _>("offline") })
            .await;
        assert_eq!(result, Err("offline"));
        assert_eq!(cache.get(now), Some(&7));
        assert_eq!(cache.get(later), None);
    }
}
