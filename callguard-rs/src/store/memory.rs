//! Provides an in-process store with the same semantics as the redis backend.
//!
//! The memory store supports everything the cache and the limiter use: plain values with an
//! optional expiry, sorted sets of leases, glob based scans and the lease acquisition script
//! (see [ACQUIRE_SLOT](crate::limiter::ACQUIRE_SLOT)) which is emulated natively. Other scripts
//! are rejected with [StoreError::UnsupportedScript].
//!
//! Additionally, failures can be injected (see [MemoryStore::fail_next] and
//! [MemoryStore::set_online]) so that the reconnect logic and the degradation paths of the
//! components can be tested without a real server.
//!
//! Scans always complete in a single step, therefore deleting keys while scanning never skips
//! any key.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::store::{Connection, Connector, Script, ScriptArg, StoreError};

enum Value {
    Plain(Vec<u8>),
    Leases(HashMap<String, f64>),
}

struct Entry {
    value: Value,
    expires: Option<Instant>,
}

impl Entry {
    fn is_alive(&self, now: Instant) -> bool {
        self.expires.map(|expires| expires > now).unwrap_or(true)
    }
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

#[derive(Default)]
struct Shared {
    databases: Mutex<HashMap<i64, Entries>>,
    offline: AtomicBool,
    failures: AtomicUsize,
    connections: AtomicUsize,
}

/// Provides an in-process store.
///
/// All clones share the same data. A memory store is its own [Connector], so it can be handed to
/// [Store::new](crate::store::Store::new) while keeping a clone around to inject failures.
///
/// Like a redis server, the store is split into numbered databases. A new store uses database 0,
/// [Connector::select] hands out the others. Injected failures apply to all databases.
///
/// # Examples
///
/// ```
/// # use callguard::store::Store;
/// # use callguard::store::memory::MemoryStore;
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryStore::new();
/// let store = Store::new(backend.clone());
///
/// backend.set_online(false);
/// assert!(store.get("key").await.is_err());
///
/// backend.set_online(true);
/// assert_eq!(store.get("key").await.unwrap(), None);
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    database: i64,
    entries: Entries,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    /// Creates a new and empty store.
    pub fn new() -> Self {
        MemoryStore::open(Arc::new(Shared::default()), 0)
    }

    fn open(shared: Arc<Shared>, database: i64) -> Self {
        let entries = shared
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(database)
            .or_default()
            .clone();

        MemoryStore {
            shared,
            database,
            entries,
        }
    }

    /// Returns the number of the database used by this handle.
    pub fn database(&self) -> i64 {
        self.database
    }

    /// Lets the next `count` operations fail as if the connection was dropped.
    pub fn fail_next(&self, count: usize) {
        self.shared.failures.store(count, Ordering::SeqCst);
    }

    /// Toggles whether the store is reachable at all.
    pub fn set_online(&self, online: bool) {
        self.shared.offline.store(!online, Ordering::SeqCst);
    }

    /// Returns the number of connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Returns the number of keys which are currently alive.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|entry| entry.is_alive(now)).count()
    }

    /// Determines if no key is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Determines if the given key is alive.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .get(key)
            .map(|entry| entry.is_alive(now))
            .unwrap_or(false)
    }

    /// Returns the remaining time to live of the given key.
    ///
    /// Returns **None** if the key doesn't exist or never expires (see [MemoryStore::contains]).
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|entry| entry.is_alive(now))
            .and_then(|entry| entry.expires)
            .map(|expires| expires.saturating_duration_since(now))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for MemoryStore {
    fn connect(&self) -> Result<Box<dyn Connection>, StoreError> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_owned()));
        }

        let _ = self.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }

    fn select(&self, database: i64) -> Result<Box<dyn Connector>, StoreError> {
        Ok(Box::new(MemoryStore::open(self.shared.clone(), database)))
    }

    fn database(&self) -> i64 {
        self.database
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.database)
    }
}

struct MemoryConnection {
    store: MemoryStore,
}

impl MemoryConnection {
    /// Simulates the network: checks if the store is reachable and consumes injected failures.
    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        let shared = &self.store.shared;
        if shared.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset by peer".to_owned()));
        }

        let injected = shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            });
        if injected.is_ok() {
            return Err(StoreError::Unavailable("broken pipe".to_owned()));
        }

        let mut entries = self.store.lock();
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_alive(now));

        Ok(entries)
    }

    fn wrong_type() -> StoreError {
        StoreError::Command(
            "WRONGTYPE Operation against a key holding the wrong kind of value".to_owned(),
        )
    }

    fn acquire_slot(
        entries: &mut HashMap<String, Entry>,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError> {
        let key = keys
            .first()
            .ok_or_else(|| StoreError::Command("acquire_slot requires one key".to_owned()))?;
        let number = |index: usize| {
            args.get(index)
                .and_then(ScriptArg::as_number)
                .ok_or_else(|| {
                    StoreError::Command(format!("argument {} must be numeric", index + 1))
                })
        };
        let now = number(0)?;
        let ttl = number(1)?;
        let limit = number(2)?;
        let token = args
            .get(3)
            .map(ScriptArg::as_text)
            .ok_or_else(|| StoreError::Command("acquire_slot requires a token".to_owned()))?;

        let active = match entries.get_mut(key) {
            Some(Entry {
                value: Value::Leases(leases),
                ..
            }) => {
                leases.retain(|_, score| *score < 0. || *score > now);
                leases.len()
            }
            Some(_) => return Err(MemoryConnection::wrong_type()),
            None => 0,
        };
        if active == 0 {
            // Empty sorted sets vanish along with their expiry...
            let _ = entries.remove(key);
        }

        if active as f64 >= limit {
            return Ok(0);
        }

        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            value: Value::Leases(HashMap::new()),
            expires: None,
        });
        if let Value::Leases(leases) = &mut entry.value {
            let _ = leases.insert(token, now + ttl);
        }

        let expiry = ttl.ceil();
        if expiry <= 0. {
            let _ = entries.remove(key);
        } else {
            entry.expires = Some(Instant::now() + Duration::from_secs(expiry as u64));
        }

        Ok(1)
    }
}

/// Translates a redis glob pattern into an anchored regular expression.
fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut result = String::from("^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => result.push_str(".*"),
            '?' => result.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    result.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            '[' => {
                result.push('[');
                for class_char in chars.by_ref() {
                    match class_char {
                        ']' => break,
                        '^' | '-' => result.push(class_char),
                        other => result.push_str(&regex::escape(&other.to_string())),
                    }
                }
                result.push(']');
            }
            other => result.push_str(&regex::escape(&other.to_string())),
        }
    }
    result.push('$');

    Regex::new(&result)
        .map_err(|error| StoreError::Command(format!("Invalid pattern '{}': {}", pattern, error)))
}

impl Connection for MemoryConnection {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.entries()?.get(key) {
            Some(Entry {
                value: Value::Plain(data),
                ..
            }) => Ok(Some(data.clone())),
            Some(_) => Err(MemoryConnection::wrong_type()),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let _ = self.entries()?.insert(
            key.to_owned(),
            Entry {
                value: Value::Plain(value.to_vec()),
                expires: None,
            },
        );

        Ok(())
    }

    fn set_ex(&mut self, key: &str, seconds: u64, value: &[u8]) -> Result<(), StoreError> {
        if seconds == 0 {
            return Err(StoreError::Command(
                "invalid expire time in 'setex' command".to_owned(),
            ));
        }

        let _ = self.entries()?.insert(
            key.to_owned(),
            Entry {
                value: Value::Plain(value.to_vec()),
                expires: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );

        Ok(())
    }

    fn delete(&mut self, keys: &[String]) -> Result<u64, StoreError> {
        let mut entries = self.entries()?;
        Ok(keys
            .iter()
            .filter(|key| entries.remove(key.as_str()).is_some())
            .count() as u64)
    }

    fn scan(
        &mut self,
        _cursor: u64,
        pattern: &str,
        _count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let regex = glob_to_regex(pattern)?;
        let mut keys: Vec<String> = self
            .entries()?
            .keys()
            .filter(|key| regex.is_match(key))
            .cloned()
            .collect();
        keys.sort();

        Ok((0, keys))
    }

    fn zrem(&mut self, key: &str, member: &str) -> Result<u64, StoreError> {
        let mut entries = self.entries()?;
        let (removed, now_empty) = match entries.get_mut(key) {
            Some(Entry {
                value: Value::Leases(leases),
                ..
            }) => (leases.remove(member).is_some(), leases.is_empty()),
            Some(_) => return Err(MemoryConnection::wrong_type()),
            None => (false, false),
        };
        if now_empty {
            let _ = entries.remove(key);
        }

        Ok(if removed { 1 } else { 0 })
    }

    fn eval(
        &mut self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError> {
        if script.name() != crate::limiter::ACQUIRE_SLOT.name() {
            return Err(StoreError::UnsupportedScript(script.name().to_owned()));
        }

        let mut entries = self.entries()?;
        MemoryConnection::acquire_slot(&mut entries, keys, args)
    }

    fn flush_db(&mut self) -> Result<(), StoreError> {
        self.entries()?.clear();
        Ok(())
    }
}
