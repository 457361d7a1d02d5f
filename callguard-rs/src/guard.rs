//! Combines validator, limiters and cache around a single call.
//!
//! The layers are applied from the outside in:
//!
//! `Validator -> Limiter(s) -> Cache -> work`
//!
//! The validator is outermost so that each retry has to pass the limiters again and gets a chance
//! to be answered from the cache. Limiters are acquired in the order they were added and released
//! in reverse order.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use callguard::cache::{Cache, CacheSettings, Ttl};
//! # use callguard::guard::Guard;
//! # use callguard::invocation::Invocation;
//! # use callguard::limiter::Limiter;
//! # use callguard::reply::HttpReply;
//! # use callguard::store::Store;
//! # use callguard::validator::{RetryCondition, Validator};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = Store::memory();
//! let guard = Guard::new()
//!     .validated(Validator::new(None, Some(RetryCondition::on_status([503])?))?)
//!     .limited(Limiter::rate(store.clone(), 10, Duration::from_secs(1)))
//!     .limited(Limiter::concurrency(store.clone(), 2, Duration::from_secs(30)))
//!     .cached(Arc::new(Cache::new(store, CacheSettings::default().with_ttl(Ttl::Seconds(60)))));
//!
//! let invocation = Invocation::new("crm::customer").method("GET").url("https://crm/customers/1");
//! let reply = guard.run(&invocation, || async { Ok(HttpReply::new(200, "{}")) }).await?;
//! assert_eq!(reply.status, 200);
//! # Ok(())
//! # }
//! ```
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::Cache;
use crate::invocation::Invocation;
use crate::limiter::Limiter;
use crate::reply::Reply;
use crate::validator::Validator;

/// Wraps calls into a validator, any number of limiters and a cache (all of them optional).
#[derive(Debug)]
pub struct Guard<T> {
    validator: Option<Validator<T>>,
    limiters: Vec<Limiter>,
    cache: Option<Arc<Cache>>,
}

impl<T> Default for Guard<T> {
    fn default() -> Self {
        Guard {
            validator: None,
            limiters: Vec::new(),
            cache: None,
        }
    }
}

impl<T> Guard<T>
where
    T: Reply + Serialize + DeserializeOwned,
{
    /// Creates a guard which doesn't apply anything yet.
    pub fn new() -> Self {
        Guard::default()
    }

    /// Applies the given validator.
    pub fn validated(mut self, validator: Validator<T>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Adds a limiter. Limiters are acquired in the order they are added.
    pub fn limited(mut self, limiter: Limiter) -> Self {
        self.limiters.push(limiter);
        self
    }

    /// Applies the given cache.
    pub fn cached(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Runs the work produced by `work` for the given call through all layers.
    ///
    /// `work` is invoked once per attempt and has to start a fresh call each time.
    pub async fn run<F, Fut>(&self, invocation: &Invocation, mut work: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match &self.validator {
            Some(validator) => {
                validator
                    .call(move || self.attempt(invocation, work()))
                    .await
            }
            None => self.attempt(invocation, work()).await,
        }
    }

    /// Provides a synchronous version of [Guard::run] for code outside of an async runtime.
    pub fn run_blocking<F>(&self, invocation: &Invocation, mut work: F) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        crate::blocking::run(self.run(invocation, move || std::future::ready(work())))?
    }

    async fn attempt<Fut>(&self, invocation: &Invocation, work: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut leases = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            // Leases acquired so far are released on drop if a later limiter fails...
            leases.push(limiter.acquire_for(invocation).await?);
        }

        let outcome = match &self.cache {
            Some(cache) => cache.call(invocation, work).await,
            None => work.await,
        };

        for lease in leases.into_iter().rev() {
            lease.release().await;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cache::{Cache, CacheSettings, Ttl};
    use crate::guard::Guard;
    use crate::invocation::Invocation;
    use crate::limiter::{Limiter, LimiterSettings};
    use crate::reply::HttpReply;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use crate::validator::{RetryCondition, Validator};

    fn invocation() -> Invocation {
        Invocation::new("billing::invoice")
            .method("GET")
            .url("https://billing.example.com/invoices/17")
    }

    #[test]
    fn retries_pass_the_limiter_and_cache_again() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone());
            let cache = Arc::new(Cache::new(
                store.clone(),
                CacheSettings::default().with_ttl(Ttl::Seconds(60)),
            ));
            let limiter = Limiter::concurrency(store, 1, Duration::from_secs(60))
                .with_settings(LimiterSettings {
                    poll: Duration::from_millis(5),
                    ..LimiterSettings::default()
                });
            let guard = Guard::new()
                .validated(
                    Validator::new(
                        None,
                        Some(RetryCondition::on_status([503]).unwrap().with_max_count(3)),
                    )
                    .unwrap(),
                )
                .limited(limiter)
                .cached(cache.clone());

            let attempts = AtomicUsize::new(0);
            let reply = guard
                .run(&invocation(), || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        Ok(HttpReply::new(if attempt < 3 { 503 } else { 200 }, "paid"))
                    }
                })
                .await
                .unwrap();

            assert_eq!(reply.status, 200);
            assert_eq!(attempts.load(Ordering::SeqCst), 3);
            // Each retry looked into the cache, only the successful reply was stored...
            assert_eq!(cache.stats().misses(), 3);
            assert_eq!(cache.stats().writes(), 1);

            // The next call is answered by the cache...
            let cached = guard
                .run(&invocation(), || async { Ok(HttpReply::new(500, "")) })
                .await
                .unwrap();
            assert_eq!(cached, reply);

            // ...and all leases have been released again.
            assert_eq!(backend.len(), 1);
        });
    }

    #[test]
    fn an_empty_guard_simply_runs_the_work() {
        let guard = Guard::<String>::new();
        let result = guard
            .run_blocking(&invocation(), || Ok("plain".to_owned()))
            .unwrap();

        assert_eq!(result, "plain");
    }
}
