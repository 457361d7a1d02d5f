//! Provides a shared cache for the results of guarded calls.
//!
//! The cache never keeps anything in process. Each lookup and each write goes to the
//! [Store] so that all processes sharing the store also share their results.
//!
//! # Keys
//! A key always starts with the configured prefix and the owner of the call (see
//! [Invocation::new]). For request-shaped calls, one segment per field follows:
//!
//! ```text
//! <prefix>:<owner>:m=<method>:u=<url>:h=<headers>:c=<cookies>:p=<params>
//!                 :b=<body>:a=<args>:k=<other>
//! ```
//! The line break above is only for readability.
//!
//! Each segment is the fingerprint of `{"<field>": <value>}` on its own, so that any subset of
//! the fields can be replaced by a wildcard when invalidating (see [Invalidation]). All other
//! calls use a single fingerprint over all arguments: `<prefix>:<owner>:g=<arguments>`.
//!
//! # Time to live
//! * [Ttl::Disabled]: the cache is bypassed completely.
//! * [Ttl::Forever]: results are stored without any expiry.
//! * [Ttl::Seconds]: results are stored for the given number of seconds. Zero or a negative
//!   number means that nothing is ever stored.
//!
//! Results which carry a fault or a status >= 400 are never stored.
//!
//! # Database
//! The cache keeps its entries in a database of its own (see [CacheSettings::database] and
//! [Cache::open]), as [Cache::flush_namespace] wipes the whole database it uses.
//!
//! # Degradation
//! If the store is unavailable (even after reconnecting), the cache gets out of the way: a
//! failed lookup invokes the work directly and skips the write-back, failed writes are logged and
//! ignored. Therefore an outage of the store never changes the outcome of a call.
//!
//! # Examples
//!
//! ```
//! # use callguard::cache::{Cache, CacheSettings, Ttl};
//! # use callguard::invocation::Invocation;
//! # use callguard::store::Store;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let cache = Cache::new(Store::memory(), CacheSettings::default().with_ttl(Ttl::Seconds(60)));
//! let invocation = Invocation::new("math::square").arg(&7);
//!
//! assert_eq!(cache.call(&invocation, async { Ok(49) }).await?, 49);
//! // The work isn't invoked again, the cached value is returned...
//! assert_eq!(cache.call(&invocation, async { Ok(0) }).await?, 49);
//! # Ok(())
//! # }
//! ```
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::fingerprint::{to_value, Fields};
use crate::invocation::{Body, Invocation};
use crate::reply::{Observation, Reply};
use crate::store::{escape_glob, Resilience, Store, StoreError};

/// The number of keys requested per SCAN step.
const SCAN_COUNT: usize = 1000;

/// The default maximal number of keys removed by an invalidation.
pub const DEFAULT_INVALIDATION_LIMIT: usize = 100_000;

/// The maximal number of keys removed by [Cache::clear_prefix].
pub const CLEAR_PREFIX_LIMIT: usize = 1_000_000;

/// Determines if and for how long results are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ttl {
    /// The cache is bypassed.
    Disabled,
    /// Results never expire.
    Forever,
    /// Results expire after the given number of seconds. Values <= 0 disable storing.
    Seconds(i64),
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl::Disabled
    }
}

impl Ttl {
    /// Parses a TTL as found in the config.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callguard::cache::Ttl;
    /// assert_eq!(Ttl::parse("disabled").unwrap(), Ttl::Disabled);
    /// assert_eq!(Ttl::parse("forever").unwrap(), Ttl::Forever);
    /// assert_eq!(Ttl::parse("300").unwrap(), Ttl::Seconds(300));
    /// assert_eq!(Ttl::parse("-1").unwrap(), Ttl::Seconds(-1));
    /// assert_eq!(Ttl::parse("2m").unwrap(), Ttl::Seconds(120));
    /// assert_eq!(Ttl::parse("3000ms").unwrap(), Ttl::Seconds(3));
    /// assert!(Ttl::parse("500ms").is_err());
    /// assert!(Ttl::parse("sometimes").is_err());
    /// ```
    ///
    /// The store only expires keys with a precision of seconds. Durations with a fractional
    /// second are therefore rejected instead of being truncated (which would turn "500ms" into
    /// a TTL of zero and silently disable storing).
    pub fn parse(value: &str) -> anyhow::Result<Ttl> {
        match value.trim().to_lowercase().as_str() {
            "" | "disabled" | "off" | "none" => Ok(Ttl::Disabled),
            "forever" | "infinite" | "inf" => Ok(Ttl::Forever),
            other => match other.parse::<i64>() {
                Ok(seconds) => Ok(Ttl::Seconds(seconds)),
                Err(_) => {
                    let duration = crate::fmt::parse_duration(other)?;
                    if duration.subsec_nanos() != 0 {
                        anyhow::bail!(
                            "Cannot use '{}' as TTL: only whole seconds are supported.",
                            value
                        );
                    }

                    Ok(Ttl::Seconds(i64::try_from(duration.as_secs())?))
                }
            },
        }
    }
}

/// Contains the settings of a [Cache].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    /// The first segment of all keys.
    pub prefix: String,
    /// Determines if and for how long results are kept.
    pub ttl: Ttl,
    /// The retry policy used for all store operations.
    pub resilience: Resilience,
    /// The number of the database holding the entries (see [Cache::open]).
    pub database: i64,
}

/// The database used by caches unless configured otherwise. Database 0 is left to the limiter.
pub const DEFAULT_CACHE_DATABASE: i64 = 1;

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            prefix: "cache".to_owned(),
            ttl: Ttl::Disabled,
            resilience: Resilience::default(),
            database: DEFAULT_CACHE_DATABASE,
        }
    }
}

impl CacheSettings {
    /// Returns a copy of the settings using the given TTL.
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns a copy of the settings using the given prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Counts what the cache did.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    degraded: AtomicU64,
}

impl CacheStats {
    /// Returns the number of lookups which found a value.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups which found nothing.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the number of values written.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of operations skipped as the store was unavailable.
    pub fn degraded(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Computes the hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.
        } else {
            hits as f32 / total as f32 * 100.
        }
    }

    fn count(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Enumerates the segments of a request-shaped key in their order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    Method,
    Url,
    Headers,
    Cookies,
    Params,
    Body,
    Args,
    Other,
}

impl Segment {
    const ALL: [Segment; 8] = [
        Segment::Method,
        Segment::Url,
        Segment::Headers,
        Segment::Cookies,
        Segment::Params,
        Segment::Body,
        Segment::Args,
        Segment::Other,
    ];

    fn tag(self) -> &'static str {
        match self {
            Segment::Method => "m",
            Segment::Url => "u",
            Segment::Headers => "h",
            Segment::Cookies => "c",
            Segment::Params => "p",
            Segment::Body => "b",
            Segment::Args => "a",
            Segment::Other => "k",
        }
    }

    fn field(self) -> &'static str {
        match self {
            Segment::Method => "method",
            Segment::Url => "url",
            Segment::Headers => "headers",
            Segment::Cookies => "cookies",
            Segment::Params => "params",
            Segment::Body => "body",
            Segment::Args => "args",
            Segment::Other => "other_kwargs",
        }
    }

    fn value_of(self, invocation: &Invocation) -> Value {
        match self {
            Segment::Method => invocation.method_value(),
            Segment::Url => invocation.url_value(),
            Segment::Headers => invocation.headers_value(),
            Segment::Cookies => invocation.cookies_value(),
            Segment::Params => invocation.params_value(),
            Segment::Body => invocation.body_value(),
            Segment::Args => invocation.args_value(),
            Segment::Other => invocation.extra_value(),
        }
    }

    fn render(self, value: Value) -> String {
        let mut fields = Fields::new();
        fields.insert_value(self.field(), value);
        format!("{}={}", self.tag(), fields.fingerprint())
    }
}

/// Describes which entries to remove.
///
/// Every field which isn't specified matches any value. Specifying nothing at all matches every
/// entry of the selected owner (or of all owners).
///
/// # Examples
///
/// ```
/// # use callguard::cache::Invalidation;
/// let invalidation = Invalidation::owner("shop::fetch_products").url("https://shop.example.com");
/// let pattern = invalidation.pattern("cache");
///
/// assert!(pattern.starts_with("cache:shop::fetch_products:m=*:u="));
/// assert!(pattern.ends_with(":h=*:c=*:p=*:b=*:a=*:k=*"));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Invalidation {
    owner: Option<String>,
    filters: Vec<(Segment, Value)>,
    limit: Option<usize>,
}

impl Invalidation {
    /// Matches the entries of all owners.
    pub fn any_owner() -> Self {
        Invalidation::default()
    }

    /// Only matches entries of the given owner.
    pub fn owner(owner: impl Into<String>) -> Self {
        Invalidation {
            owner: Some(owner.into()),
            ..Invalidation::default()
        }
    }

    fn filter(mut self, segment: Segment, value: Value) -> Self {
        self.filters.retain(|(existing, _)| *existing != segment);
        self.filters.push((segment, value));
        self
    }

    /// Only matches entries with the given method.
    pub fn method<T: Serialize + Debug + ?Sized>(self, method: &T) -> Self {
        self.filter(Segment::Method, to_value(method))
    }

    /// Only matches entries with the given url.
    pub fn url<T: Serialize + Debug + ?Sized>(self, url: &T) -> Self {
        self.filter(Segment::Url, to_value(url))
    }

    /// Only matches entries with the given headers.
    pub fn headers<T: Serialize + Debug + ?Sized>(self, headers: &T) -> Self {
        self.filter(Segment::Headers, to_value(headers))
    }

    /// Only matches entries with the given cookies.
    pub fn cookies<T: Serialize + Debug + ?Sized>(self, cookies: &T) -> Self {
        self.filter(Segment::Cookies, to_value(cookies))
    }

    /// Only matches entries with the given query parameters.
    pub fn params<T: Serialize + Debug + ?Sized>(self, params: &T) -> Self {
        self.filter(Segment::Params, to_value(params))
    }

    /// Only matches entries with the given body.
    pub fn body(self, body: &Body) -> Self {
        self.filter(Segment::Body, body.to_value())
    }

    /// Only matches entries with the given positional arguments.
    pub fn args(self, args: &[Value]) -> Self {
        self.filter(Segment::Args, Value::Array(args.to_vec()))
    }

    /// Only matches entries with the given other named arguments.
    pub fn other(self, other: &Fields) -> Self {
        self.filter(Segment::Other, other.to_value())
    }

    /// Limits the number of removed entries (100 000 by default).
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Computes the SCAN pattern for the given key prefix.
    pub fn pattern(&self, prefix: &str) -> String {
        let owner = self
            .owner
            .as_deref()
            .map(escape_glob)
            .unwrap_or_else(|| "*".to_owned());
        let prefix = escape_glob(prefix);

        if self.filters.is_empty() {
            return format!("{}:{}:*", prefix, owner);
        }

        let segments: Vec<String> = Segment::ALL
            .iter()
            .map(|segment| {
                match self.filters.iter().find(|(filtered, _)| filtered == segment) {
                    Some((_, value)) => segment.render(value.clone()),
                    None => format!("{}=*", segment.tag()),
                }
            })
            .collect();

        format!("{}:{}:{}", prefix, owner, segments.join(":"))
    }
}

/// Represents the outcome of a lookup.
#[derive(Debug, PartialEq)]
pub enum Lookup<T> {
    /// A value was found.
    Hit(T),
    /// Nothing (or nothing readable) was found.
    Miss,
    /// The store couldn't be reached.
    Unavailable,
}

/// Caches results of guarded calls in the shared store.
#[derive(Debug)]
pub struct Cache {
    store: Store,
    settings: CacheSettings,
    stats: CacheStats,
}

impl Cache {
    /// Creates a new cache which keeps its entries in the database given by the settings.
    ///
    /// The database is selected on the server of the given store, which itself may point to
    /// another database (e.g. the one used by the limiters).
    ///
    /// # Examples
    ///
    /// ```
    /// # use callguard::cache::{Cache, CacheSettings, Ttl};
    /// # use callguard::store::Store;
    /// let store = Store::memory();
    /// let cache = Cache::open(&store, CacheSettings::default().with_ttl(Ttl::Forever)).unwrap();
    ///
    /// assert_eq!(store.describe(), "memory/0");
    /// assert_eq!(cache.describe_store(), "memory/1");
    /// ```
    pub fn open(store: &Store, settings: CacheSettings) -> Result<Self, StoreError> {
        let store = store.select(settings.database)?;
        Ok(Cache::new(store, settings))
    }

    /// Creates a new cache which uses the given store as is.
    ///
    /// Note that [CacheSettings::database] is ignored here. Use [Cache::open] to select it.
    pub fn new(store: Store, settings: CacheSettings) -> Self {
        Cache {
            store: store.with_resilience(settings.resilience),
            settings,
            stats: CacheStats::default(),
        }
    }

    /// Returns the settings of this cache.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Returns the statistics of this cache.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns a description of the store (and database) holding the entries.
    pub fn describe_store(&self) -> String {
        self.store.describe()
    }

    /// Computes the key under which the result of the given call is stored.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callguard::cache::{Cache, CacheSettings};
    /// # use callguard::invocation::Invocation;
    /// # use callguard::store::Store;
    /// let cache = Cache::new(Store::memory(), CacheSettings::default());
    ///
    /// let plain = cache.key_for(&Invocation::new("math::square").arg(&7));
    /// assert!(plain.starts_with("cache:math::square:g="));
    ///
    /// let request = cache.key_for(&Invocation::new("crm::fetch").method("GET").url("/x"));
    /// assert!(request.starts_with("cache:crm::fetch:m="));
    /// assert_eq!(request.matches('=').count(), 8);
    /// ```
    pub fn key_for(&self, invocation: &Invocation) -> String {
        if invocation.is_request_shaped() {
            let segments: Vec<String> = Segment::ALL
                .iter()
                .map(|segment| segment.render(segment.value_of(invocation)))
                .collect();

            format!(
                "{}:{}:{}",
                self.settings.prefix,
                invocation.owner(),
                segments.join(":")
            )
        } else {
            format!(
                "{}:{}:g={}",
                self.settings.prefix,
                invocation.owner(),
                invocation.all_arguments().fingerprint()
            )
        }
    }

    /// Determines if the given outcome may be stored.
    pub fn is_cacheable<T: Reply>(outcome: &anyhow::Result<T>) -> bool {
        outcome.is_ok() && !Observation::of(outcome).is_error_status()
    }

    /// Invokes the given work unless a result for the given call is already cached.
    ///
    /// Successful results are stored afterwards (unless their status is >= 400). If the store is
    /// unavailable, the work is invoked directly and nothing is stored.
    pub async fn call<T, F>(&self, invocation: &Invocation, work: F) -> anyhow::Result<T>
    where
        T: Reply + Serialize + DeserializeOwned,
        F: Future<Output = anyhow::Result<T>>,
    {
        if self.settings.ttl == Ttl::Disabled {
            return work.await;
        }

        let key = self.key_for(invocation);
        match self.lookup_key(&key).await {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Unavailable => return work.await,
            Lookup::Miss => (),
        }

        let outcome = work.await;
        if Cache::is_cacheable(&outcome) {
            if let Ok(value) = &outcome {
                let _ = self.store_key(&key, value).await;
            }
        }

        outcome
    }

    /// Provides a synchronous version of [Cache::call] for code outside of an async runtime.
    pub fn call_blocking<T, F>(&self, invocation: &Invocation, work: F) -> anyhow::Result<T>
    where
        T: Reply + Serialize + DeserializeOwned,
        F: FnOnce() -> anyhow::Result<T>,
    {
        crate::blocking::run(self.call(invocation, async move { work() }))?
    }

    /// Looks up the cached result of the given call.
    pub async fn lookup<T: DeserializeOwned>(&self, invocation: &Invocation) -> Lookup<T> {
        self.lookup_key(&self.key_for(invocation)).await
    }

    /// Stores the result of the given call. Returns **true** if the value was actually written.
    pub async fn store<T: Serialize>(&self, invocation: &Invocation, value: &T) -> bool {
        self.store_key(&self.key_for(invocation), value).await
    }

    async fn lookup_key<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        match self.store.get(key).await {
            Ok(Some(data)) => match decode(&data) {
                Ok(value) => {
                    CacheStats::count(&self.stats.hits);
                    log::debug!("Cache hit for {}.", key);
                    Lookup::Hit(value)
                }
                Err(error) => {
                    CacheStats::count(&self.stats.misses);
                    log::warn!("Ignoring unreadable cache entry {}: {}", key, error);
                    Lookup::Miss
                }
            },
            Ok(None) => {
                CacheStats::count(&self.stats.misses);
                log::debug!("Cache miss for {}.", key);
                Lookup::Miss
            }
            Err(error) => {
                CacheStats::count(&self.stats.degraded);
                log::warn!(
                    "Cannot read {} from the cache ({}). Invoking the call without caching...",
                    key,
                    error
                );
                Lookup::Unavailable
            }
        }
    }

    async fn store_key<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let seconds = match self.settings.ttl {
            Ttl::Disabled => return false,
            Ttl::Seconds(seconds) if seconds <= 0 => return false,
            Ttl::Seconds(seconds) => Some(seconds as u64),
            Ttl::Forever => None,
        };

        let data = match encode(value) {
            Ok(data) => data,
            Err(error) => {
                log::warn!("Cannot cache {}: {}", key, error);
                return false;
            }
        };

        let result = match seconds {
            Some(seconds) => self.store.set_ex(key, seconds, data).await,
            None => self.store.set(key, data).await,
        };

        match result {
            Ok(_) => {
                CacheStats::count(&self.stats.writes);
                log::debug!("Cached {}.", key);
                true
            }
            Err(error) => {
                CacheStats::count(&self.stats.degraded);
                log::warn!("Cannot write {} into the cache: {}", key, error);
                false
            }
        }
    }

    /// Removes the cached result of exactly the given call.
    pub async fn forget(&self, invocation: &Invocation) -> bool {
        let key = self.key_for(invocation);
        match self.store.delete(vec![key.clone()]).await {
            Ok(deleted) => deleted > 0,
            Err(error) => {
                log::warn!("Cannot remove {} from the cache: {}", key, error);
                false
            }
        }
    }

    /// Removes all entries matching the given invalidation and returns how many were removed.
    ///
    /// If the store fails while scanning, 0 is reported and the invalidation can simply be
    /// repeated.
    pub async fn invalidate(&self, invalidation: &Invalidation) -> u64 {
        self.scan_delete(
            &invalidation.pattern(&self.settings.prefix),
            invalidation.limit.unwrap_or(DEFAULT_INVALIDATION_LIMIT),
        )
        .await
    }

    /// Removes all entries stored under the prefix of this cache (of all owners).
    pub async fn clear_prefix(&self) -> u64 {
        self.scan_delete(
            &format!("{}:*", escape_glob(&self.settings.prefix)),
            CLEAR_PREFIX_LIMIT,
        )
        .await
    }

    /// Removes all entries under the prefix of this cache whose key contains the given fragment.
    pub async fn purge_matching(&self, fragment: &str, limit: usize) -> u64 {
        self.scan_delete(
            &format!(
                "{}:*{}*",
                escape_glob(&self.settings.prefix),
                escape_glob(fragment)
            ),
            limit,
        )
        .await
    }

    /// Wipes the whole database of the store.
    ///
    /// Note that this doesn't stop at the prefix of this cache. Everything sharing the same
    /// database is removed as well, which is why caches get a database of their own (see
    /// [Cache::open]).
    pub async fn flush_namespace(&self) -> bool {
        match self.store.flush_db().await {
            Ok(_) => {
                log::info!("Flushed the whole store {}.", self.store.describe());
                true
            }
            Err(error) => {
                log::warn!("Cannot flush the store: {}", error);
                false
            }
        }
    }

    /// Lists up to `limit` entries stored under the prefix of this cache.
    ///
    /// Entries which cannot be read as **T** are skipped. If the store fails, the entries found
    /// so far are returned.
    pub async fn entries<T: DeserializeOwned>(&self, limit: usize) -> Vec<(String, T)> {
        let pattern = format!("{}:*", escape_glob(&self.settings.prefix));
        let mut result = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = match self.store.scan(cursor, pattern.as_str(), SCAN_COUNT).await {
                Ok(page) => page,
                Err(error) => {
                    log::warn!("Cannot list the cache entries: {}", error);
                    return result;
                }
            };

            for key in keys {
                if result.len() >= limit {
                    return result;
                }
                match self.store.get(key.as_str()).await {
                    Ok(Some(data)) => {
                        if let Ok(value) = decode(&data) {
                            result.push((key, value));
                        }
                    }
                    Ok(None) => (),
                    Err(error) => {
                        log::warn!("Cannot list the cache entries: {}", error);
                        return result;
                    }
                }
            }

            if next == 0 {
                return result;
            }
            cursor = next;
        }
    }

    async fn scan_delete(&self, pattern: &str, limit: usize) -> u64 {
        match self.try_scan_delete(pattern, limit).await {
            Ok(deleted) => {
                log::debug!("Removed {} cache entries matching {}.", deleted, pattern);
                deleted
            }
            Err(error) => {
                log::warn!("Cannot remove the cache entries matching {}: {}", pattern, error);
                0
            }
        }
    }

    async fn try_scan_delete(&self, pattern: &str, limit: usize) -> Result<u64, StoreError> {
        let mut deleted = 0;
        let mut cursor = 0;
        loop {
            let (next, mut keys) = self.store.scan(cursor, pattern, SCAN_COUNT).await?;
            keys.truncate(limit.saturating_sub(deleted as usize));
            if !keys.is_empty() {
                deleted += self.store.delete(keys).await?;
            }

            if next == 0 || deleted as usize >= limit {
                return Ok(deleted);
            }
            cursor = next;
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|error| StoreError::Serialization(error.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(data).map_err(|error| StoreError::Serialization(error.to_string()))
}
