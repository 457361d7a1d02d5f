//! Bounds how many calls of the same shape may run at once or within a time window.
//!
//! A limiter hands out *leases*. Each lease is a random token stored in a sorted set of the
//! store, scored by the point in time at which it expires. The set is identified by a
//! *lease key* which is derived from the shape of a call (method, url, headers and cookies, see
//! [Invocation::shape]). Query parameters, bodies and any other arguments don't matter, so all
//! calls of the same endpoint draw from one pool.
//!
//! Granting a lease is performed by [ACQUIRE_SLOT] which runs atomically within the store: it
//! evicts all expired leases, compares the remaining ones against the limit and adds the new
//! lease if there is room. As all coordination happens within the store, any number of
//! processes on any number of machines can share a limit.
//!
//! # Policies
//! * [Policy::Concurrency]: a lease is removed as soon as the guarded call finishes. The period
//!   is the maximal time a lease may be held, so that crashed processes don't block a slot
//!   forever.
//! * [Policy::Rate]: leases are never removed, they simply expire once the window has passed.
//!   A window of zero lets every call pass (while still running through the store).
//!
//! If no slot is available, the limiter waits for the poll interval and tries again. There is no
//! upper bound for this. Wrap the whole call in `tokio::time::timeout` if waiting has to be
//! bounded.
//!
//! If the store is unavailable (even after reconnecting), acquiring fails, as the limiter cannot
//! safely assume that a slot is available.
//!
//! # Examples
//!
//! ```
//! # use std::time::Duration;
//! # use callguard::invocation::Invocation;
//! # use callguard::limiter::Limiter;
//! # use callguard::store::Store;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let limiter = Limiter::concurrency(Store::memory(), 4, Duration::from_secs(60));
//! let invocation = Invocation::new("crm::fetch").method("GET").url("https://crm.example.com");
//!
//! let answer = limiter.call(&invocation, async { Ok(42) }).await?;
//! assert_eq!(answer, 42);
//! # Ok(())
//! # }
//! ```
use std::future::Future;
use std::time::Duration;

use crate::fingerprint::Fingerprint;
use crate::fmt::format_duration;
use crate::invocation::Invocation;
use crate::store::{Script, ScriptArg, Store, StoreError};

/// Evicts expired leases, checks the capacity and grants a new lease.
///
/// Expects the lease key as only key and *now* (seconds since the epoch), the period (in
/// seconds), the limit and the token as arguments. Returns 1 if the lease was granted and 0
/// otherwise.
pub const ACQUIRE_SLOT: Script = Script::new(
    "acquire_slot",
    r#"local key = KEYS[1]
local now = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local token = ARGV[4]
redis.call('ZREMRANGEBYSCORE', key, 0, now)
local cnt = redis.call('ZCARD', key)
if cnt >= limit then
    return 0
end
redis.call('ZADD', key, now + ttl, token)
redis.call('EXPIRE', key, math.ceil(ttl))
return 1
"#,
);

/// Determines how leases are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Limits the number of calls running at the same time.
    Concurrency,
    /// Limits the number of calls started within a sliding window.
    Rate,
}

impl Policy {
    /// Returns the name of the policy as used in lease keys.
    pub fn name(self) -> &'static str {
        match self {
            Policy::Concurrency => "concurrency",
            Policy::Rate => "rate",
        }
    }

    /// Determines if leases are removed once a call finishes.
    pub fn releases(self) -> bool {
        self == Policy::Concurrency
    }
}

/// Contains the settings shared by all limiters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimiterSettings {
    /// The first segment of all lease keys.
    pub namespace: String,
    /// The pause between two attempts to acquire a lease.
    pub poll: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        LimiterSettings {
            namespace: "limiter".to_owned(),
            poll: Duration::from_millis(200),
        }
    }
}

/// Hands out leases for calls of the same shape.
#[derive(Clone, Debug)]
pub struct Limiter {
    store: Store,
    policy: Policy,
    limit: u32,
    period: Duration,
    settings: LimiterSettings,
}

impl Limiter {
    /// Creates a limiter which permits at most `limit` calls of a shape to run at once.
    ///
    /// A lease which isn't released within `hold_timeout` is reclaimed anyway.
    pub fn concurrency(store: Store, limit: u32, hold_timeout: Duration) -> Self {
        Limiter::new(store, Policy::Concurrency, limit, hold_timeout)
    }

    /// Creates a limiter which permits at most `limit` calls of a shape per `window`.
    pub fn rate(store: Store, limit: u32, window: Duration) -> Self {
        Limiter::new(store, Policy::Rate, limit, window)
    }

    /// Creates a limiter for the given policy.
    pub fn new(store: Store, policy: Policy, limit: u32, period: Duration) -> Self {
        Limiter {
            store,
            policy,
            limit,
            period,
            settings: LimiterSettings::default(),
        }
    }

    /// Returns a copy of this limiter which uses the given settings.
    pub fn with_settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the policy of this limiter.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Returns the maximal number of active leases per lease key.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Returns the hold timeout or window of this limiter.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Computes the lease key for the given shape.
    ///
    /// The policy is part of the key, so that a rate limiter and a concurrency limiter never
    /// share a pool, even if they use the same namespace.
    pub fn lease_key(&self, shape: &Fingerprint) -> String {
        format!("{}:{}:{}", self.settings.namespace, self.policy.name(), shape)
    }

    /// Computes the lease key for the given call.
    pub fn key_for(&self, invocation: &Invocation) -> String {
        self.lease_key(&invocation.shape().fingerprint())
    }

    /// Tries to acquire a lease for the given lease key without waiting.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.;

        let granted = self
            .store
            .eval(
                &ACQUIRE_SLOT,
                vec![key.to_owned()],
                vec![
                    ScriptArg::Float(now),
                    ScriptArg::Float(self.period.as_secs_f64()),
                    ScriptArg::Int(i64::from(self.limit)),
                    ScriptArg::Text(token.clone()),
                ],
            )
            .await?;

        if granted == 1 {
            log::debug!("Granted lease {} for {}.", token, key);
            Ok(Some(Lease {
                key: key.to_owned(),
                token,
                store: self.store.clone(),
                armed: self.policy.releases(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Acquires a lease for the given lease key, waiting as long as necessary.
    pub async fn acquire(&self, key: &str) -> Result<Lease, StoreError> {
        let mut attempts: u32 = 0;
        loop {
            if let Some(lease) = self.try_acquire(key).await? {
                if attempts > 0 {
                    log::debug!(
                        "Acquired {} after waiting about {}.",
                        key,
                        format_duration(self.settings.poll * attempts)
                    );
                }
                return Ok(lease);
            }

            attempts = attempts.saturating_add(1);
            if attempts == 1 {
                log::debug!(
                    "All {} slots of {} are taken. Waiting...",
                    self.limit,
                    key
                );
            }
            tokio::time::sleep(self.settings.poll).await;
        }
    }

    /// Acquires a lease for the given call, waiting as long as necessary.
    pub async fn acquire_for(&self, invocation: &Invocation) -> Result<Lease, StoreError> {
        self.acquire(&self.key_for(invocation)).await
    }

    /// Invokes the given work once a lease for the given call has been acquired.
    ///
    /// For concurrency limiters, the lease is released afterwards, no matter if the work
    /// succeeded or failed. If the returned future is dropped while the work is running, the
    /// lease is released in the background.
    pub async fn call<T, F>(&self, invocation: &Invocation, work: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let lease = self.acquire_for(invocation).await?;
        let outcome = work.await;
        lease.release().await;

        outcome
    }

    /// Provides a synchronous version of [Limiter::call] for code outside of an async runtime.
    pub fn call_blocking<T, F>(&self, invocation: &Invocation, work: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        crate::blocking::run(self.call(invocation, async move { work() }))?
    }
}

/// Represents a granted slot.
///
/// Leases of a concurrency limiter are released via [Lease::release] or, if they are simply
/// dropped, in the background. Leases of a rate limiter expire on their own.
#[derive(Debug)]
pub struct Lease {
    key: String,
    token: String,
    store: Store,
    armed: bool,
}

impl Lease {
    /// Returns the lease key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the token which identifies this lease within its key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Releases the lease.
    ///
    /// Failures are only logged. The lease will then expire once its hold timeout is reached.
    pub async fn release(mut self) {
        if !self.armed {
            return;
        }

        self.armed = false;
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        Lease::remove(self.store.clone(), key, token).await;
    }

    async fn remove(store: Store, key: String, token: String) {
        match store.zrem(key.as_str(), token.as_str()).await {
            Ok(_) => log::debug!("Released lease {} for {}.", token, key),
            Err(error) => log::warn!(
                "Cannot release lease {} for {}: {}. It will expire on its own.",
                token,
                key,
                error
            ),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn(Lease::remove(self.store.clone(), key, token));
            }
            Err(_) => log::warn!(
                "Cannot release lease {} for {} outside of a runtime. It will expire on its own.",
                token,
                key
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::invocation::Invocation;
    use crate::limiter::{Limiter, LimiterSettings, Policy};
    use crate::store::memory::MemoryStore;
    use crate::store::{Resilience, Store, StoreError};

    fn quick(limiter: Limiter) -> Limiter {
        limiter.with_settings(LimiterSettings {
            poll: Duration::from_millis(10),
            ..LimiterSettings::default()
        })
    }

    fn endpoint() -> Invocation {
        Invocation::new("crm::fetch")
            .method("GET")
            .url("https://crm.example.com/customers")
    }

    #[test]
    fn lease_keys_depend_on_shape_and_policy_only() {
        let store = Store::memory();
        let concurrency = Limiter::concurrency(store.clone(), 1, Duration::from_secs(1));
        let rate = Limiter::rate(store, 1, Duration::from_secs(1));

        let plain = endpoint();
        let decorated = endpoint()
            .params(&serde_json::json!({"page": 7}))
            .arg(&1)
            .extra("verbose", &true);

        assert_eq!(concurrency.key_for(&plain), concurrency.key_for(&decorated));
        assert_ne!(concurrency.key_for(&plain), rate.key_for(&plain));
        assert!(concurrency.key_for(&plain).starts_with("limiter:concurrency:"));
        assert!(rate.key_for(&plain).starts_with("limiter:rate:"));
    }

    #[test]
    fn denied_leases_are_granted_once_a_slot_frees() {
        crate::testing::test_async(async {
            let limiter = Limiter::concurrency(Store::memory(), 2, Duration::from_secs(60));
            let key = limiter.key_for(&endpoint());

            let first = limiter.try_acquire(&key).await.unwrap().unwrap();
            let _second = limiter.try_acquire(&key).await.unwrap().unwrap();
            assert!(limiter.try_acquire(&key).await.unwrap().is_none());

            first.release().await;
            assert!(limiter.try_acquire(&key).await.unwrap().is_some());
        });
    }

    #[test]
    fn at_most_limit_callers_are_inside_at_once() {
        crate::testing::test_async(async {
            let limiter = quick(Limiter::concurrency(
                Store::memory(),
                2,
                Duration::from_secs(60),
            ));
            let key = limiter.key_for(&endpoint());
            let inside = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let denied = Arc::new(AtomicUsize::new(0));
            let finished = Arc::new(AtomicUsize::new(0));
            let everyone_tried = Arc::new(tokio::sync::Barrier::new(5));

            let callers = (0..5).map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                let denied = denied.clone();
                let finished = finished.clone();
                let everyone_tried = everyone_tried.clone();
                tokio::spawn(async move {
                    let first_attempt = limiter.try_acquire(&key).await?;
                    if first_attempt.is_none() {
                        let _ = denied.fetch_add(1, Ordering::SeqCst);
                    }

                    // Nobody releases a slot before all callers made their first attempt...
                    let _ = everyone_tried.wait().await;
                    let lease = match first_attempt {
                        Some(lease) => lease,
                        None => limiter.acquire(&key).await?,
                    };

                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = inside.fetch_sub(1, Ordering::SeqCst);
                    let _ = finished.fetch_add(1, Ordering::SeqCst);
                    lease.release().await;

                    Ok::<(), StoreError>(())
                })
            });

            for result in futures::future::join_all(callers).await {
                result.unwrap().unwrap();
            }

            assert_eq!(denied.load(Ordering::SeqCst), 3);
            assert_eq!(peak.load(Ordering::SeqCst), 2);
            assert_eq!(finished.load(Ordering::SeqCst), 5);
        });
    }

    #[test]
    fn guarded_calls_wait_for_a_free_slot() {
        crate::testing::test_async(async {
            let limiter = quick(Limiter::concurrency(
                Store::memory(),
                2,
                Duration::from_secs(60),
            ));
            let inside = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let callers = (0..5).map(|_| {
                let limiter = limiter.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    limiter
                        .call(&endpoint(), async {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            let _ = inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            });

            for result in futures::future::join_all(callers).await {
                result.unwrap().unwrap();
            }

            assert_eq!(peak.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn rate_limits_reopen_after_the_window() {
        crate::testing::test_async(async {
            let limiter = Limiter::rate(Store::memory(), 2, Duration::from_millis(500));
            let key = limiter.key_for(&endpoint());

            // Rate leases are never released, not even when dropped...
            assert!(limiter.try_acquire(&key).await.unwrap().is_some());
            assert!(limiter.try_acquire(&key).await.unwrap().is_some());
            assert!(limiter.try_acquire(&key).await.unwrap().is_none());

            tokio::time::sleep(Duration::from_millis(600)).await;
            assert!(limiter.try_acquire(&key).await.unwrap().is_some());
        });
    }

    #[test]
    fn a_zero_window_lets_everything_pass() {
        crate::testing::test_async(async {
            let limiter = Limiter::new(Store::memory(), Policy::Rate, 1, Duration::ZERO);
            let key = limiter.key_for(&endpoint());

            for _ in 0..10 {
                assert!(limiter.try_acquire(&key).await.unwrap().is_some());
            }
        });
    }

    #[test]
    fn leases_are_released_when_the_work_fails() {
        crate::testing::test_async(async {
            let limiter = quick(Limiter::concurrency(
                Store::memory(),
                1,
                Duration::from_secs(60),
            ));

            let failed = limiter
                .call::<(), _>(&endpoint(), async { Err(anyhow::anyhow!("boom")) })
                .await;
            assert!(failed.is_err());

            let key = limiter.key_for(&endpoint());
            assert!(limiter.try_acquire(&key).await.unwrap().is_some());
        });
    }

    #[test]
    fn dropped_leases_are_released_in_the_background() {
        crate::testing::test_async(async {
            let limiter = Limiter::concurrency(Store::memory(), 1, Duration::from_secs(60));
            let key = limiter.key_for(&endpoint());

            drop(limiter.try_acquire(&key).await.unwrap().unwrap());

            let mut granted = false;
            for _ in 0..50 {
                if limiter.try_acquire(&key).await.unwrap().is_some() {
                    granted = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(granted);
        });
    }

    #[test]
    fn an_unavailable_store_is_fatal() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(Resilience {
                retries: 1,
                delay: Duration::from_millis(1),
            });
            let limiter = Limiter::concurrency(store, 1, Duration::from_secs(60));
            backend.set_online(false);

            let invoked = AtomicUsize::new(0);
            let outcome = limiter
                .call(&endpoint(), async {
                    let _ = invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;

            assert!(outcome.unwrap_err().downcast_ref::<StoreError>().is_some());
            assert_eq!(invoked.load(Ordering::SeqCst), 0);
        });
    }
}
