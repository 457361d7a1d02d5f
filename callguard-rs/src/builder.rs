//! Provides a builder which sets up logging, the config and the store.
//!
//! The result is a [Toolkit] which hands out caches and limiters that share one store and use
//! the settings from the config. Limiters keep their leases in the database of the store, caches
//! use a database of their own (**cache.database**, 1 by default). Flushing a cache therefore
//! never drops a lease.
//!
//! # Example
//! ```no_run
//! # use std::time::Duration;
//! # use callguard::builder::Builder;
//! # use callguard::guard::Guard;
//! # use callguard::invocation::Invocation;
//! # use callguard::reply::HttpReply;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Reads config/settings.yml and connects to the configured store...
//!     let toolkit = Builder::new().enable_all().build().await?;
//!
//!     let guard = Guard::new()
//!         .limited(toolkit.concurrency_limiter(4))
//!         .cached(toolkit.cache()?);
//!
//!     let invocation = Invocation::new("crm::customer").method("GET").url("https://crm/c/1");
//!     let reply = guard.run(&invocation, || async { Ok(HttpReply::new(200, "{}")) }).await?;
//!     log::info!("Received {}", reply.body_text());
//!
//!     Ok(())
//! }
//! ```
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, CacheSettings, Ttl};
use crate::config::Config;
use crate::limiter::Limiter;
use crate::store::{Store, StoreSettings};
use crate::{init_logging, CALLGUARD_VERSION};

/// The default maximal time a concurrency lease may be held.
pub const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_secs(60);

/// Sets up the toolkit by selectively enabling its components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    setup_config: bool,
    config_file: Option<String>,
    store: Option<Store>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables logging and loading the config.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.setup_config = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// This initializes **simplelog** to log to stdout.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Enables loading **config/settings.yml**.
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Loads the given file instead of **config/settings.yml**. This also enables the config.
    pub fn with_config_file(mut self, file: impl Into<String>) -> Self {
        self.setup_config = true;
        self.config_file = Some(file.into());
        self
    }

    /// Uses the given store instead of the one described by the config.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the toolkit.
    ///
    /// Fails if the config file exists but cannot be parsed or contains invalid values.
    pub async fn build(self) -> anyhow::Result<Toolkit> {
        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. CALLGUARD (v {}) running on {} core(s) in {} CPU(s)",
            CALLGUARD_VERSION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        let config = Arc::new(Config::new(
            self.config_file
                .as_deref()
                .unwrap_or("config/settings.yml"),
        ));
        if self.setup_config {
            config.load().await?;
        }

        let store_settings = config.current().store_settings()?;
        let store = match self.store {
            Some(store) => store,
            None => Store::open(&store_settings)?,
        };
        log::info!("Using store {}.", store.describe());

        Ok(Toolkit {
            store,
            store_settings,
            config,
        })
    }
}

/// Provides caches and limiters which share a store and the loaded configuration.
pub struct Toolkit {
    store: Store,
    store_settings: StoreSettings,
    config: Arc<Config>,
}

impl Toolkit {
    /// Returns the shared store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns the config.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Creates a cache as described by the **cache** section of the config.
    pub fn cache(&self) -> anyhow::Result<Arc<Cache>> {
        let settings = self
            .config
            .current()
            .cache_settings(&self.store_settings)?;

        self.open_cache(settings)
    }

    /// Creates a cache as described by the config but using the given TTL.
    pub fn cache_with_ttl(&self, ttl: Ttl) -> anyhow::Result<Arc<Cache>> {
        let settings = self
            .config
            .current()
            .cache_settings(&self.store_settings)?
            .with_ttl(ttl);

        self.open_cache(settings)
    }

    fn open_cache(&self, settings: CacheSettings) -> anyhow::Result<Arc<Cache>> {
        if settings.database == self.store.database() {
            anyhow::bail!(
                "The cache cannot use database {} of {}, as it holds the limiter leases.",
                settings.database,
                self.store.describe()
            );
        }

        Ok(Arc::new(Cache::open(&self.store, settings)?))
    }

    /// Creates a concurrency limiter which reclaims leases after [DEFAULT_HOLD_TIMEOUT].
    pub fn concurrency_limiter(&self, limit: u32) -> Limiter {
        self.limiter(Limiter::concurrency(
            self.store.clone(),
            limit,
            DEFAULT_HOLD_TIMEOUT,
        ))
    }

    /// Creates a rate limiter which permits `limit` calls per `window`.
    pub fn rate_limiter(&self, limit: u32, window: Duration) -> Limiter {
        self.limiter(Limiter::rate(self.store.clone(), limit, window))
    }

    fn limiter(&self, limiter: Limiter) -> Limiter {
        match self.config.current().limiter_settings() {
            Ok(settings) => limiter.with_settings(settings),
            Err(error) => {
                log::warn!("Invalid limiter settings ({}) - using defaults.", error);
                limiter
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::builder::Builder;
    use crate::cache::{Lookup, Ttl};
    use crate::invocation::Invocation;
    use crate::limiter::Policy;
    use crate::store::Store;

    #[test]
    fn a_toolkit_uses_the_loaded_settings() {
        crate::testing::test_async(async {
            let toolkit = Builder::new()
                .with_store(Store::memory())
                .build()
                .await
                .unwrap();
            toolkit
                .config()
                .load_from_string(
                    "cache:\n    ttl: 30\n    prefix: test\nlimiter:\n    namespace: quota\n",
                    None,
                )
                .unwrap();

            let cache = toolkit.cache().unwrap();
            assert_eq!(cache.settings().ttl, Ttl::Seconds(30));
            assert_eq!(cache.settings().prefix, "test");
            assert_eq!(
                toolkit.cache_with_ttl(Ttl::Forever).unwrap().settings().ttl,
                Ttl::Forever
            );

            let limiter = toolkit.rate_limiter(5, Duration::from_secs(1));
            assert_eq!(limiter.policy(), Policy::Rate);
            assert!(limiter
                .key_for(&Invocation::new("f").url("/x"))
                .starts_with("quota:rate:"));
            assert_eq!(toolkit.concurrency_limiter(2).limit(), 2);
        });
    }

    #[test]
    fn the_store_can_be_selected_via_config() {
        crate::testing::test_async(async {
            let dir = std::env::temp_dir().join(format!("callguard-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            let file = dir.join("settings.yml");
            std::fs::write(&file, "store:\n    url: memory\n").unwrap();

            let toolkit = Builder::new()
                .with_config_file(file.to_string_lossy())
                .build()
                .await
                .unwrap();
            assert_eq!(toolkit.store().describe(), "memory/0");

            std::fs::remove_dir_all(&dir).unwrap();
        });
    }

    #[test]
    fn flushing_a_cache_keeps_the_leases() {
        crate::testing::test_async(async {
            let toolkit = Builder::new()
                .with_store(Store::memory())
                .build()
                .await
                .unwrap();
            let cache = toolkit.cache_with_ttl(Ttl::Forever).unwrap();
            let limiter = toolkit.concurrency_limiter(1);
            let invocation = Invocation::new("crm::customer").url("/customers/1");
            let key = limiter.key_for(&invocation);

            assert!(cache.store(&invocation, &"cached").await);
            let lease = limiter.try_acquire(&key).await.unwrap().unwrap();
            assert!(limiter.try_acquire(&key).await.unwrap().is_none());

            assert!(cache.flush_namespace().await);
            assert_eq!(cache.lookup::<String>(&invocation).await, Lookup::Miss);
            assert!(limiter.try_acquire(&key).await.unwrap().is_none());

            lease.release().await;
            assert!(limiter.try_acquire(&key).await.unwrap().is_some());
        });
    }

    #[test]
    fn caches_refuse_the_database_of_the_limiters() {
        crate::testing::test_async(async {
            let toolkit = Builder::new()
                .with_store(Store::memory())
                .build()
                .await
                .unwrap();
            toolkit
                .config()
                .load_from_string("cache:\n    database: 0\n", None)
                .unwrap();

            assert!(toolkit.cache().is_err());
            assert!(toolkit.cache_with_ttl(Ttl::Forever).is_err());
        });
    }
}
