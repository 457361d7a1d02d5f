//! Contains the configuration of the store, the caches and the limiters.
//!
//! The configuration is loaded from **config/settings.yml** (see
//! [Builder](crate::builder::Builder)). Everything is optional, missing values fall back to
//! their defaults:
//!
//! ```yaml
//! store:
//!     url: "redis://127.0.0.1:6379/0"   # or "memory" for an in-process store
//!     connect_timeout: 2s
//!     io_timeout: 2s
//!     retries: 2
//!     retry_delay: 150ms
//! cache:
//!     prefix: cache
//!     ttl: 60s                          # disabled | forever | <duration> | <seconds>
//!     database: 1                       # must differ from the database of the store
//!     retries: 2                        # defaults to store.retries
//!     retry_delay: 150ms                # defaults to store.retry_delay
//! limiter:
//!     namespace: limiter
//!     poll: 200ms
//! ```
//!
//! Durations are either given as string with a unit (see [parse_duration]) or as plain number of
//! milliseconds. The TTL of a cache is the exception, a plain number is treated as seconds there.
//!
//! The config can be reloaded at any time (e.g. via [Config::load_from_string]). Listeners
//! obtained via [Config::notifier] are informed about each change. As with any handle obtained
//! via [Config::current], typed settings are a snapshot and aren't updated on their own.
//!
//! # Examples
//!
//! ```
//! # use std::time::Duration;
//! # use callguard::cache::Ttl;
//! # use callguard::config::Config;
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! store:
//!     url: memory
//!     retries: 5
//! cache:
//!     ttl: 5m
//! ", None).unwrap();
//!
//! let handle = config.current();
//! let store = handle.store_settings().unwrap();
//! assert_eq!(store.url, "memory");
//! assert_eq!(store.resilience.retries, 5);
//!
//! let cache = handle.cache_settings(&store).unwrap();
//! assert_eq!(cache.ttl, Ttl::Seconds(300));
//! assert_eq!(cache.resilience.retries, 5);
//! assert_eq!(cache.prefix, "cache");
//! ```
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::cache::{CacheSettings, Ttl};
use crate::fmt::parse_duration;
use crate::limiter::LimiterSettings;
use crate::store::{Resilience, StoreSettings};

/// Provides access to the configuration.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// The message itself carries no information. Once one is received, the config has changed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Don't keep a handle around for long, as it isn't updated if the config changes.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new and empty config which will be read from the given file.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Returns the name of the underlying file.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Returns the modification date of the file which was loaded last.
    pub fn last_loaded(&self) -> Option<SystemTime> {
        self.config.load().1
    }

    /// Reads the underlying file.
    ///
    /// A missing file isn't an error, the defaults remain in place.
    pub async fn load(&self) -> anyhow::Result<()> {
        let metadata = match tokio::fs::metadata(&self.filename).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                log::info!(
                    "Config file {} doesn't exist - using defaults.",
                    &self.filename
                );
                return Ok(());
            }
        };

        log::info!("Loading config file {}...", &self.filename);
        let data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        self.load_from_string(data.as_str(), metadata.modified().ok())
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// If the data cannot be parsed, the previous configuration is kept.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;
        let doc = docs.into_iter().next().unwrap_or(Yaml::Null);

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the loaded document.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dotted path like "store.url".
    ///
    /// Returns **Yaml::BadValue** if any part of the path doesn't exist.
    pub fn query(&self, query: impl AsRef<str>) -> &Yaml {
        query
            .as_ref()
            .split('.')
            .fold(&self.config.0, |node, key| &node[key])
    }

    fn string(&self, query: &str, default: &str) -> anyhow::Result<String> {
        match self.query(query) {
            Yaml::BadValue | Yaml::Null => Ok(default.to_owned()),
            Yaml::String(value) => Ok(value.clone()),
            Yaml::Integer(value) => Ok(value.to_string()),
            other => Err(anyhow::anyhow!(
                "Expected a string for {} but found {:?}",
                query,
                other
            )),
        }
    }

    fn duration(&self, query: &str, default: Duration) -> anyhow::Result<Duration> {
        match self.query(query) {
            Yaml::BadValue | Yaml::Null => Ok(default),
            Yaml::Integer(millis) if *millis >= 0 => Ok(Duration::from_millis(*millis as u64)),
            Yaml::String(value) => {
                parse_duration(value).with_context(|| format!("Invalid value for {}", query))
            }
            other => Err(anyhow::anyhow!(
                "Expected a duration for {} but found {:?}",
                query,
                other
            )),
        }
    }

    fn count(&self, query: &str, default: u32) -> anyhow::Result<u32> {
        match self.query(query) {
            Yaml::BadValue | Yaml::Null => Ok(default),
            Yaml::Integer(value) => u32::try_from(*value)
                .with_context(|| format!("Invalid value for {}: {}", query, value)),
            other => Err(anyhow::anyhow!(
                "Expected a positive number for {} but found {:?}",
                query,
                other
            )),
        }
    }

    fn database(&self, query: &str, default: i64) -> anyhow::Result<i64> {
        match self.query(query) {
            Yaml::BadValue | Yaml::Null => Ok(default),
            Yaml::Integer(value) if *value >= 0 => Ok(*value),
            other => Err(anyhow::anyhow!(
                "Expected a database number for {} but found {:?}",
                query,
                other
            )),
        }
    }

    fn ttl(&self, query: &str) -> anyhow::Result<Ttl> {
        match self.query(query) {
            Yaml::BadValue | Yaml::Null | Yaml::Boolean(false) => Ok(Ttl::Disabled),
            Yaml::Integer(seconds) => Ok(Ttl::Seconds(*seconds)),
            Yaml::String(value) => {
                Ttl::parse(value).with_context(|| format!("Invalid value for {}", query))
            }
            other => Err(anyhow::anyhow!(
                "Expected a TTL for {} but found {:?}",
                query,
                other
            )),
        }
    }

    /// Reads the settings of the store.
    pub fn store_settings(&self) -> anyhow::Result<StoreSettings> {
        let defaults = StoreSettings::default();
        Ok(StoreSettings {
            url: self.string("store.url", &defaults.url)?,
            connect_timeout: self.duration("store.connect_timeout", defaults.connect_timeout)?,
            io_timeout: self.duration("store.io_timeout", defaults.io_timeout)?,
            resilience: Resilience {
                retries: self.count("store.retries", defaults.resilience.retries)?,
                delay: self.duration("store.retry_delay", defaults.resilience.delay)?,
            },
        })
    }

    /// Reads the settings of caches. Unless specified otherwise, the retry policy of the store
    /// is used.
    pub fn cache_settings(&self, store: &StoreSettings) -> anyhow::Result<CacheSettings> {
        let defaults = CacheSettings::default();
        Ok(CacheSettings {
            prefix: self.string("cache.prefix", &defaults.prefix)?,
            ttl: self.ttl("cache.ttl")?,
            resilience: Resilience {
                retries: self.count("cache.retries", store.resilience.retries)?,
                delay: self.duration("cache.retry_delay", store.resilience.delay)?,
            },
            database: self.database("cache.database", defaults.database)?,
        })
    }

    /// Reads the settings shared by all limiters.
    pub fn limiter_settings(&self) -> anyhow::Result<LimiterSettings> {
        let defaults = LimiterSettings::default();
        Ok(LimiterSettings {
            namespace: self.string("limiter.namespace", &defaults.namespace)?,
            poll: self.duration("limiter.poll", defaults.poll)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use crate::cache::Ttl;
    use crate::config::Config;
    use crate::store::StoreSettings;

    #[test]
    fn defaults_apply_to_an_empty_config() {
        let config = Config::new("settings.yml");
        let handle = config.current();

        let store = handle.store_settings().unwrap();
        assert_eq!(store, StoreSettings::default());

        let cache = handle.cache_settings(&store).unwrap();
        assert_eq!(cache.ttl, Ttl::Disabled);
        assert_eq!(cache.prefix, "cache");
        assert_eq!(cache.database, 1);

        let limiter = handle.limiter_settings().unwrap();
        assert_eq!(limiter.namespace, "limiter");
        assert_eq!(limiter.poll, Duration::from_millis(200));
    }

    #[test]
    fn all_sections_are_read() {
        let config = Config::new("settings.yml");
        config
            .load_from_string(
                "
store:
    url: redis://cache-host:6380/3
    connect_timeout: 5s
    io_timeout: 750
    retries: 4
    retry_delay: 1s
cache:
    prefix: crm
    ttl: -1
    database: 7
    retries: 0
limiter:
    namespace: quotas
    poll: 50ms
",
                None,
            )
            .unwrap();
        let handle = config.current();

        let store = handle.store_settings().unwrap();
        assert_eq!(store.url, "redis://cache-host:6380/3");
        assert_eq!(store.connect_timeout, Duration::from_secs(5));
        assert_eq!(store.io_timeout, Duration::from_millis(750));
        assert_eq!(store.resilience.retries, 4);

        let cache = handle.cache_settings(&store).unwrap();
        assert_eq!(cache.prefix, "crm");
        assert_eq!(cache.ttl, Ttl::Seconds(-1));
        assert_eq!(cache.database, 7);
        assert_eq!(cache.resilience.retries, 0);
        assert_eq!(cache.resilience.delay, Duration::from_secs(1));

        let limiter = handle.limiter_settings().unwrap();
        assert_eq!(limiter.namespace, "quotas");
        assert_eq!(limiter.poll, Duration::from_millis(50));
    }

    #[test]
    fn invalid_values_are_reported() {
        let config = Config::new("settings.yml");
        config
            .load_from_string("store:\n    retries: -3\n    retry_delay: soon\n", None)
            .unwrap();

        assert!(config.current().store_settings().is_err());

        let store = StoreSettings::default();
        config
            .load_from_string("cache:\n    ttl: 500ms\n", None)
            .unwrap();
        assert!(config.current().cache_settings(&store).is_err());

        config
            .load_from_string("cache:\n    database: -1\n", None)
            .unwrap();
        assert!(config.current().cache_settings(&store).is_err());
    }

    #[test]
    fn malformed_updates_keep_the_previous_config() {
        crate::testing::test_async(async {
            let config = Config::new("settings.yml");
            let mut notifier = config.notifier();

            config
                .load_from_string("cache:\n    ttl: forever\n", Some(SystemTime::now()))
                .unwrap();
            assert!(notifier.recv().await.is_ok());

            assert!(config.load_from_string("cache: 'broken", None).is_err());
            assert!(config.last_loaded().is_some());
            assert_eq!(
                config.current().query("cache.ttl").as_str(),
                Some("forever")
            );
        });
    }

    #[test]
    fn missing_files_are_skipped() {
        crate::testing::test_async(async {
            let config = Config::new("config/does-not-exist.yml");

            assert!(config.load().await.is_ok());
            assert!(config.current().query("store.url").is_badvalue());
        });
    }
}
