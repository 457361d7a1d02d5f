//! Connects the store to a Redis (or any RESP compatible) server.
//!
//! We use the blocking client of the **redis** crate and move all calls into blocking workers
//! (see [Store::execute](crate::store::Store::execute)). Scripts are sent via **EVALSHA** and
//! transparently loaded on the first **NOSCRIPT** reply.
use std::time::Duration;

use ::redis::{Client, ErrorKind, RedisError};

use crate::store::{Connection, Connector, Script, ScriptArg, StoreError};

impl From<RedisError> for StoreError {
    fn from(error: RedisError) -> Self {
        if error.is_io_error()
            || error.is_timeout()
            || error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.kind() == ErrorKind::BusyLoadingError
            || error.kind() == ErrorKind::TryAgain
        {
            StoreError::Unavailable(error.to_string())
        } else {
            StoreError::Command(error.to_string())
        }
    }
}

/// Opens blocking connections to a redis server.
pub struct RedisConnector {
    client: Client,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl RedisConnector {
    /// Creates a connector for the given URL (e.g. "redis://127.0.0.1:6379/0").
    ///
    /// This only validates the URL, the server is contacted once a connection is requested.
    pub fn new(
        url: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|error| {
            StoreError::Command(format!("Invalid store URL '{}': {}", url, error))
        })?;

        Ok(RedisConnector {
            client,
            connect_timeout,
            io_timeout,
        })
    }
}

impl Connector for RedisConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, StoreError> {
        let connection = self
            .client
            .get_connection_with_timeout(self.connect_timeout)?;
        connection.set_read_timeout(Some(self.io_timeout))?;
        connection.set_write_timeout(Some(self.io_timeout))?;

        log::debug!("Opened a new connection to {}.", self.describe());

        Ok(Box::new(RedisConnection { connection }))
    }

    fn select(&self, database: i64) -> Result<Box<dyn Connector>, StoreError> {
        let mut info = self.client.get_connection_info().clone();
        info.redis.db = database;
        let client = Client::open(info)?;

        Ok(Box::new(RedisConnector {
            client,
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
        }))
    }

    fn database(&self) -> i64 {
        self.client.get_connection_info().redis.db
    }

    fn describe(&self) -> String {
        let info = self.client.get_connection_info();
        format!("{:?}/{}", info.addr, info.redis.db)
    }
}

struct RedisConnection {
    connection: ::redis::Connection,
}

impl Connection for RedisConnection {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(::redis::cmd("GET").arg(key).query(&mut self.connection)?)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query::<()>(&mut self.connection)?;

        Ok(())
    }

    fn set_ex(&mut self, key: &str, seconds: u64, value: &[u8]) -> Result<(), StoreError> {
        ::redis::cmd("SETEX")
            .arg(key)
            .arg(seconds)
            .arg(value)
            .query::<()>(&mut self.connection)?;

        Ok(())
    }

    fn delete(&mut self, keys: &[String]) -> Result<u64, StoreError> {
        Ok(::redis::cmd("DEL").arg(keys).query(&mut self.connection)?)
    }

    fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        Ok(::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query(&mut self.connection)?)
    }

    fn zrem(&mut self, key: &str, member: &str) -> Result<u64, StoreError> {
        Ok(::redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query(&mut self.connection)?)
    }

    fn eval(
        &mut self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError> {
        let script = ::redis::Script::new(script.source());
        let mut invocation = script.prepare_invoke();
        for key in keys {
            let _ = invocation.key(key.as_str());
        }
        for arg in args {
            let _ = match arg {
                ScriptArg::Int(value) => invocation.arg(*value),
                ScriptArg::Float(value) => invocation.arg(*value),
                ScriptArg::Text(value) => invocation.arg(value.as_str()),
            };
        }

        Ok(invocation.invoke(&mut self.connection)?)
    }

    fn flush_db(&mut self) -> Result<(), StoreError> {
        ::redis::cmd("FLUSHDB").query::<()>(&mut self.connection)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::limiter::ACQUIRE_SLOT;
    use crate::store::{ScriptArg, Store};

    /// Requires a running server, e.g. `CALLGUARD_REDIS_URL=redis://127.0.0.1:6379/15`.
    #[test]
    #[ignore]
    fn a_real_server_grants_and_releases_slots() {
        crate::testing::test_async(async {
            let url = std::env::var("CALLGUARD_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_owned());
            let store = Store::redis(&url).unwrap();
            store.flush_db().await.unwrap();

            let acquire = |token: &str| {
                vec![
                    ScriptArg::Float(100.),
                    ScriptArg::Float(10.),
                    ScriptArg::Int(1),
                    ScriptArg::Text(token.to_owned()),
                ]
            };

            let key = vec!["test:leases".to_owned()];
            assert_eq!(store.eval(&ACQUIRE_SLOT, key.clone(), acquire("a")).await.unwrap(), 1);
            assert_eq!(store.eval(&ACQUIRE_SLOT, key.clone(), acquire("b")).await.unwrap(), 0);
            assert_eq!(store.zrem("test:leases", "a").await.unwrap(), 1);
            assert_eq!(store.eval(&ACQUIRE_SLOT, key, acquire("b")).await.unwrap(), 1);

            store.set_ex("test:value", 60, b"x".to_vec()).await.unwrap();
            let (_, keys) = store.scan(0, "test:*", 1000).await.unwrap();
            assert!(keys.contains(&"test:value".to_owned()));

            store.flush_db().await.unwrap();
        });
    }
}
