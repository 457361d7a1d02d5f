//! Provides a resilient client for the shared key-value store.
//!
//! All components talk to the store through a [Store]. It offers the handful of operations the
//! cache and the limiter need (get, set, set with expiry, delete, incremental scan, sorted set
//! member removal, flushing the database) plus running a server-side [Script] which returns a
//! single integer.
//!
//! # Blocking connections
//! The underlying connections are blocking (see [Connection]). Every operation is therefore
//! executed via `tokio::task::spawn_blocking` so that no async worker is ever blocked. Idle
//! connections are kept in a small pool and handed out to the next operation.
//!
//! # Reconnecting
//! If an operation fails because the store is unreachable (see [StoreError::Unavailable]), the
//! affected connection is discarded (along with all idle ones, as they most probably point to the
//! same dead server), the configured delay is awaited and the operation is retried on a fresh
//! connection. Once all attempts failed, the last error is returned. What happens then is up to
//! the caller: the cache degrades to pass-through, the limiter gives up.
//!
//! Scripts are not idempotent (a lease script which ran but whose reply got lost would grant a
//! second lease when sent again). Therefore [Store::eval] only retries if no connection could be
//! established, a failure after the script was sent is reported right away.
//!
//! # Databases
//! A server hosts several numbered databases. [Store::select] returns a handle to another one, so
//! that components which flush their data (like the cache) don't share a keyspace with others.
//!
//! # Backends
//! * [redis::RedisConnector] talks to a Redis (or any RESP compatible) server.
//! * [memory::MemoryStore] keeps everything within the process. It implements the exact same
//!   semantics (including expiry and the lease script) and is used by all tests.
//!
//! # Examples
//!
//! ```
//! # use callguard::store::Store;
//! # #[tokio::main]
//! # async fn main() {
//! let store = Store::memory();
//!
//! store.set_ex("greeting", 60, b"hello".to_vec()).await.unwrap();
//! assert_eq!(store.get("greeting").await.unwrap(), Some(b"hello".to_vec()));
//! assert_eq!(store.delete(vec!["greeting".to_owned()]).await.unwrap(), 1);
//! # }
//! ```
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::fmt::format_duration;

pub mod memory;
pub mod redis;

/// Enumerates the errors reported by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store couldn't be reached or dropped the connection. This is considered transient.
    #[error("the store is unavailable: {0}")]
    Unavailable(String),

    /// The store understood but rejected a command.
    #[error("the store rejected a command: {0}")]
    Command(String),

    /// The backend cannot execute the requested script.
    #[error("the store cannot execute the script '{0}'")]
    UnsupportedScript(String),

    /// A blocking worker executing a store operation crashed.
    #[error("a store worker failed: {0}")]
    Worker(String),

    /// A value couldn't be encoded for or decoded from the store.
    #[error("cannot (de)serialize a stored value: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Determines if the error is worth a reconnect and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Escapes all characters which have a special meaning in a SCAN pattern.
///
/// # Examples
///
/// ```
/// assert_eq!(callguard::store::escape_glob("fetch*[v2]?"), "fetch\\*\\[v2\\]\\?");
/// assert_eq!(callguard::store::escape_glob("crm::fetch"), "crm::fetch");
/// ```
pub fn escape_glob(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            result.push('\\');
        }
        result.push(ch);
    }

    result
}

/// Represents an argument passed to a [Script].
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptArg {
    /// An integer argument.
    Int(i64),
    /// A floating point argument (e.g. a timestamp with sub-second precision).
    Float(f64),
    /// A string argument.
    Text(String),
}

impl ScriptArg {
    /// Returns the numeric value of this argument, like Lua's `tonumber` would.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptArg::Int(value) => Some(*value as f64),
            ScriptArg::Float(value) => Some(*value),
            ScriptArg::Text(value) => value.trim().parse().ok(),
        }
    }

    /// Returns the textual value of this argument.
    pub fn as_text(&self) -> String {
        match self {
            ScriptArg::Int(value) => value.to_string(),
            ScriptArg::Float(value) => value.to_string(),
            ScriptArg::Text(value) => value.clone(),
        }
    }
}

/// Represents a server-side script which is executed atomically by the store.
///
/// The name identifies the script for backends which cannot interpret the source (see
/// [memory::MemoryStore]).
#[derive(Debug, PartialEq, Eq)]
pub struct Script {
    name: &'static str,
    source: &'static str,
}

impl Script {
    /// Creates a new script.
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Script { name, source }
    }

    /// Returns the name of the script.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the Lua source of the script.
    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// Represents a single, blocking connection to the store.
pub trait Connection: Send {
    /// Fetches the value stored for the given key.
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores a value without any expiry.
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Stores a value which expires after the given number of seconds.
    fn set_ex(&mut self, key: &str, seconds: u64, value: &[u8]) -> Result<(), StoreError>;

    /// Deletes the given keys and returns how many existed.
    fn delete(&mut self, keys: &[String]) -> Result<u64, StoreError>;

    /// Performs a single step of an incremental scan over all keys matching the given glob
    /// pattern. Returns the cursor for the next step (0 once the scan is complete) and the keys
    /// found in this step.
    fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    /// Removes a member from a sorted set and returns how many members were removed.
    fn zrem(&mut self, key: &str, member: &str) -> Result<u64, StoreError>;

    /// Executes the given script atomically.
    fn eval(
        &mut self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError>;

    /// Removes all keys of the current database.
    fn flush_db(&mut self) -> Result<(), StoreError>;
}

/// Opens new connections to a store.
pub trait Connector: Send + Sync + 'static {
    /// Opens a new connection.
    fn connect(&self) -> Result<Box<dyn Connection>, StoreError>;

    /// Returns a connector for another database of the same server.
    fn select(&self, database: i64) -> Result<Box<dyn Connector>, StoreError>;

    /// Returns the number of the database this connector uses.
    fn database(&self) -> i64;

    /// Returns a human readable description of the store (used in log messages).
    fn describe(&self) -> String;
}

/// Determines how often and how fast failed operations are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resilience {
    /// The number of additional attempts after the first one failed.
    pub retries: u32,
    /// The pause between two attempts.
    pub delay: Duration,
}

impl Default for Resilience {
    fn default() -> Self {
        Resilience {
            retries: 2,
            delay: Duration::from_millis(150),
        }
    }
}

/// Contains the settings used to open a [Store].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreSettings {
    /// The address of the store. Either a redis URL or "memory" for an in-process store.
    pub url: String,
    /// The maximal time to wait for a connection to be established.
    pub connect_timeout: Duration,
    /// The maximal time to wait for a single read or write.
    pub io_timeout: Duration,
    /// The default retry policy of the store.
    pub resilience: Resilience,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            url: "redis://127.0.0.1:6379/0".to_owned(),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
            resilience: Resilience::default(),
        }
    }
}

/// The number of idle connections we keep around.
const MAX_IDLE_CONNECTIONS: usize = 16;

/// Determines whether a failure happened while connecting or while running a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Connect,
    Command,
}

struct Pool {
    connector: Box<dyn Connector>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
}

impl Pool {
    fn checkout(&self) -> Result<Box<dyn Connection>, StoreError> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match idle {
            Some(connection) => Ok(connection),
            None => self.connector.connect(),
        }
    }

    fn checkin(&self, connection: Box<dyn Connection>) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(connection);
        }
    }

    fn discard_idle(&self) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Runs the given operation on a pooled connection. This blocks and must therefore only be
    /// called within a blocking worker.
    fn run<T>(
        &self,
        op: &(dyn Fn(&mut dyn Connection) -> Result<T, StoreError> + Send + Sync),
    ) -> Result<T, (Phase, StoreError)> {
        let mut connection = self
            .checkout()
            .map_err(|error| (Phase::Connect, error))?;
        let result = op(connection.as_mut());
        match &result {
            Err(error) if error.is_transient() => self.discard_idle(),
            _ => self.checkin(connection),
        }

        result.map_err(|error| (Phase::Command, error))
    }
}

/// Provides a shared, resilient handle to the key-value store.
///
/// Cloning a store is cheap, all clones share the same connection pool. Each clone may however
/// use its own [Resilience] (see [Store::with_resilience]).
#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool>,
    resilience: Resilience,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("store", &self.pool.connector.describe())
            .field("resilience", &self.resilience)
            .finish()
    }
}

impl Store {
    /// Creates a new store which uses the given connector to open connections.
    pub fn new(connector: impl Connector) -> Self {
        Store::with_connector(Box::new(connector))
    }

    fn with_connector(connector: Box<dyn Connector>) -> Self {
        Store {
            pool: Arc::new(Pool {
                connector,
                idle: Mutex::new(Vec::new()),
            }),
            resilience: Resilience::default(),
        }
    }

    /// Creates a store based on the given settings.
    ///
    /// Note that this doesn't connect yet, connections are opened on demand.
    pub fn open(settings: &StoreSettings) -> Result<Self, StoreError> {
        let store = if settings.url == "memory" {
            Store::new(memory::MemoryStore::new())
        } else {
            Store::new(redis::RedisConnector::new(
                &settings.url,
                settings.connect_timeout,
                settings.io_timeout,
            )?)
        };

        Ok(store.with_resilience(settings.resilience))
    }

    /// Creates a store which connects to the given redis URL using default timeouts.
    pub fn redis(url: &str) -> Result<Self, StoreError> {
        Store::open(&StoreSettings {
            url: url.to_owned(),
            ..StoreSettings::default()
        })
    }

    /// Creates a new and empty in-process store.
    pub fn memory() -> Self {
        Store::new(memory::MemoryStore::new())
    }

    /// Returns a handle to the same store which uses the given retry policy.
    pub fn with_resilience(&self, resilience: Resilience) -> Self {
        Store {
            pool: self.pool.clone(),
            resilience,
        }
    }

    /// Returns the retry policy of this handle.
    pub fn resilience(&self) -> Resilience {
        self.resilience
    }

    /// Returns a handle to another database of the same server.
    ///
    /// The new handle uses its own connection pool but keeps the [Resilience] of this one.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callguard::store::Store;
    /// # #[tokio::main]
    /// # async fn main() {
    /// let store = Store::memory();
    /// let other = store.select(1).unwrap();
    ///
    /// other.set("key", b"value".to_vec()).await.unwrap();
    /// other.flush_db().await.unwrap();
    /// assert_eq!(store.database(), 0);
    /// assert_eq!(other.database(), 1);
    /// # }
    /// ```
    pub fn select(&self, database: i64) -> Result<Self, StoreError> {
        if database == self.database() {
            return Ok(self.clone());
        }

        let store = Store::with_connector(self.pool.connector.select(database)?);
        Ok(store.with_resilience(self.resilience))
    }

    /// Returns the number of the database used by this handle.
    pub fn database(&self) -> i64 {
        self.pool.connector.database()
    }

    /// Returns a description of the store.
    pub fn describe(&self) -> String {
        self.pool.connector.describe()
    }

    /// Executes the given operation, reconnecting and retrying as specified by the
    /// [Resilience] of this handle.
    ///
    /// The operation may therefore be sent more than once and must be idempotent.
    pub async fn execute<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(&mut dyn Connection) -> Result<T, StoreError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.execute_with(true, op).await
    }

    /// Executes the given operation. If `retry_commands` is false, only failures to connect are
    /// retried, as the operation might already have been applied otherwise.
    async fn execute_with<T, F>(&self, retry_commands: bool, op: F) -> Result<T, StoreError>
    where
        F: Fn(&mut dyn Connection) -> Result<T, StoreError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 0;
        loop {
            let pool = self.pool.clone();
            let task_op = op.clone();
            let result = match tokio::task::spawn_blocking(move || pool.run(task_op.as_ref())).await
            {
                Ok(result) => result,
                Err(error) => Err((Phase::Command, StoreError::Worker(error.to_string()))),
            };

            match result {
                Err((phase, error))
                    if error.is_transient()
                        && (retry_commands || phase == Phase::Connect)
                        && attempt < self.resilience.retries =>
                {
                    attempt += 1;
                    log::warn!(
                        "Store {} is unavailable ({}). Reconnecting in {} (attempt {} of {})...",
                        self.describe(),
                        error,
                        format_duration(self.resilience.delay),
                        attempt,
                        self.resilience.retries
                    );
                    if !self.resilience.delay.is_zero() {
                        tokio::time::sleep(self.resilience.delay).await;
                    }
                }
                result => return result.map_err(|(_, error)| error),
            }
        }
    }

    /// Fetches the value stored for the given key.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.into();
        self.execute(move |connection| connection.get(&key)).await
    }

    /// Stores a value without any expiry.
    pub async fn set(&self, key: impl Into<String>, value: Vec<u8>) -> Result<(), StoreError> {
        let key = key.into();
        self.execute(move |connection| connection.set(&key, &value))
            .await
    }

    /// Stores a value which expires after the given number of seconds.
    pub async fn set_ex(
        &self,
        key: impl Into<String>,
        seconds: u64,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        let key = key.into();
        self.execute(move |connection| connection.set_ex(&key, seconds, &value))
            .await
    }

    /// Deletes the given keys and returns how many existed.
    pub async fn delete(&self, keys: Vec<String>) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        self.execute(move |connection| connection.delete(&keys))
            .await
    }

    /// Performs a single step of an incremental scan (see [Connection::scan]).
    pub async fn scan(
        &self,
        cursor: u64,
        pattern: impl Into<String>,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let pattern = pattern.into();
        self.execute(move |connection| connection.scan(cursor, &pattern, count))
            .await
    }

    /// Removes a member from a sorted set.
    pub async fn zrem(
        &self,
        key: impl Into<String>,
        member: impl Into<String>,
    ) -> Result<u64, StoreError> {
        let key = key.into();
        let member = member.into();
        self.execute(move |connection| connection.zrem(&key, &member))
            .await
    }

    /// Executes the given script atomically and returns its integer result.
    ///
    /// Once the script has been sent, a transient failure is reported without retrying, as the
    /// script might already have been executed.
    pub async fn eval(
        &self,
        script: &'static Script,
        keys: Vec<String>,
        args: Vec<ScriptArg>,
    ) -> Result<i64, StoreError> {
        self.execute_with(false, move |connection| {
            connection.eval(script, &keys, &args)
        })
        .await
    }

    /// Removes all keys of the current database.
    pub async fn flush_db(&self) -> Result<(), StoreError> {
        self.execute(|connection| connection.flush_db()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::limiter::ACQUIRE_SLOT;
    use crate::store::memory::MemoryStore;
    use crate::store::{Resilience, ScriptArg, Store, StoreError};

    async fn acquire(store: &Store, token: &str) -> Result<i64, StoreError> {
        store
            .eval(
                &ACQUIRE_SLOT,
                vec!["leases".to_owned()],
                vec![
                    ScriptArg::Float(100.),
                    ScriptArg::Float(60.),
                    ScriptArg::Int(1),
                    ScriptArg::Text(token.to_owned()),
                ],
            )
            .await
    }

    fn quick(retries: u32) -> Resilience {
        Resilience {
            retries,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn transient_failures_are_retried_on_a_fresh_connection() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(quick(2));

            store.set("key", b"value".to_vec()).await.unwrap();
            let opened = backend.connections_opened();

            backend.fail_next(2);
            assert_eq!(store.get("key").await.unwrap(), Some(b"value".to_vec()));

            // Each failure discards the connection in use, so two new ones had to be opened...
            assert_eq!(backend.connections_opened(), opened + 2);
        });
    }

    #[test]
    fn exhausted_retries_report_the_last_error() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(quick(1));

            backend.fail_next(2);
            match store.get("key").await {
                Err(StoreError::Unavailable(_)) => (),
                other => panic!("Expected the store to be unavailable, got {:?}", other),
            }

            // The budget of injected failures is used up, so the next call succeeds...
            assert_eq!(store.get("key").await.unwrap(), None);
        });
    }

    #[test]
    fn offline_stores_refuse_connections() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(quick(3));

            backend.set_online(false);
            assert!(store.set("key", Vec::new()).await.is_err());

            backend.set_online(true);
            assert!(store.set("key", Vec::new()).await.is_ok());
        });
    }

    #[test]
    fn command_errors_are_not_retried() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(quick(5));

            store.set("plain", b"x".to_vec()).await.unwrap();
            let opened = backend.connections_opened();

            // Using a plain value as sorted set is a type error, which is not transient...
            match store.zrem("plain", "member").await {
                Err(StoreError::Command(_)) => (),
                other => panic!("Expected a command error, got {:?}", other),
            }
            assert_eq!(backend.connections_opened(), opened);
        });
    }

    #[test]
    fn scripts_are_not_resent_after_a_lost_reply() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(quick(3));

            backend.fail_next(1);
            match acquire(&store, "a").await {
                Err(StoreError::Unavailable(_)) => (),
                other => panic!("Expected the store to be unavailable, got {:?}", other),
            }

            // A single failure was injected and the script wasn't sent again...
            assert_eq!(acquire(&store, "b").await.unwrap(), 1);
            assert_eq!(acquire(&store, "c").await.unwrap(), 0);
        });
    }

    #[test]
    fn scripts_are_retried_if_no_connection_could_be_opened() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(Resilience {
                retries: 3,
                delay: Duration::from_millis(50),
            });

            backend.set_online(false);
            let toggle = backend.clone();
            let reconnect = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                toggle.set_online(true);
            });

            assert_eq!(acquire(&store, "a").await.unwrap(), 1);
            reconnect.await.unwrap();
        });
    }

    #[test]
    fn databases_are_separate_keyspaces() {
        crate::testing::test_async(async {
            let backend = MemoryStore::new();
            let store = Store::new(backend.clone()).with_resilience(quick(4));
            let other = store.select(1).unwrap();

            store.set("key", b"zero".to_vec()).await.unwrap();
            other.set("key", b"one".to_vec()).await.unwrap();
            other.flush_db().await.unwrap();

            assert_eq!(store.get("key").await.unwrap(), Some(b"zero".to_vec()));
            assert_eq!(other.get("key").await.unwrap(), None);
            assert_eq!(other.resilience(), quick(4));
            assert_eq!(other.describe(), "memory/1");

            // Both databases live on the same server...
            backend.set_online(false);
            assert!(other.get("key").await.is_err());
        });
    }
}
