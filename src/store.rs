//! Append-only history of encrypted payloads, read back as a bounded replay window.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::{self, BoxFuture};

use crate::error::StoreError;

/// The most recent entries of a log, oldest first, and the log length observed atomically
/// with the read. An entry's sequence number is its 1-based position in the log, so every
/// entry with `seq <= cursor` has already been seen by whoever holds this window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    pub entries: Vec<String>,
    pub cursor: u64,
}

/// Shared history backend. Implementations must be safe for concurrent use; callers take no
/// locks around it.
pub trait MessageStore: Send + Sync + 'static {
    /// Append one ciphertext to the tail of `topic` and return its sequence number.
    fn append<'a>(&'a self, topic: &'a str, ciphertext: &'a str)
        -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Return the last `count` entries of `topic` (fewer if the log is shorter).
    fn recent_range<'a>(
        &'a self,
        topic: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<ReplayWindow, StoreError>>;
}

/// Process-local store, used when no Redis is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<T>(&self, topic: &str, f: impl FnOnce(&mut Vec<String>) -> T) -> Result<T, StoreError> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(f(logs.entry(topic.to_string()).or_default()))
    }
}

impl MessageStore for MemoryStore {
    fn append<'a>(&'a self, topic: &'a str, ciphertext: &'a str)
        -> BoxFuture<'a, Result<u64, StoreError>> {
        let res = self.with_log(topic, |log| {
            log.push(ciphertext.to_string());
            log.len() as u64
        });
        Box::pin(future::ready(res))
    }

    fn recent_range<'a>(
        &'a self,
        topic: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<ReplayWindow, StoreError>> {
        let res = self.with_log(topic, |log| {
            let start = log.len().saturating_sub(count);
            ReplayWindow {
                entries: log[start..].to_vec(),
                cursor: log.len() as u64,
            }
        });
        Box::pin(future::ready(res))
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use futures_util::future::BoxFuture;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    use super::{MessageStore, ReplayWindow};
    use crate::error::StoreError;

    /// History kept in a Redis list: `RPUSH` to append, `LRANGE`+`LLEN` in one
    /// transaction to read the window with its cursor.
    #[derive(Clone)]
    pub struct RedisStore {
        conn: ConnectionManager,
    }

    impl RedisStore {
        pub fn new(conn: ConnectionManager) -> Self {
            Self { conn }
        }
    }

    impl MessageStore for RedisStore {
        fn append<'a>(&'a self, topic: &'a str, ciphertext: &'a str)
            -> BoxFuture<'a, Result<u64, StoreError>> {
            let mut conn = self.conn.clone();
            Box::pin(async move {
                let len: u64 = conn.rpush(topic, ciphertext).await?;
                Ok(len)
            })
        }

        fn recent_range<'a>(
            &'a self,
            topic: &'a str,
            count: usize,
        ) -> BoxFuture<'a, Result<ReplayWindow, StoreError>> {
            let mut conn = self.conn.clone();
            Box::pin(async move {
                if count == 0 {
                    // LRANGE -0 -1 would return the whole list.
                    let cursor: u64 = conn.llen(topic).await?;
                    return Ok(ReplayWindow {
                        entries: Vec::new(),
                        cursor,
                    });
                }

                let start = -(count.min(isize::MAX as usize) as isize);
                let (entries, cursor): (Vec<String>, u64) = redis::pipe()
                    .atomic()
                    .cmd("LRANGE")
                    .arg(topic)
                    .arg(start)
                    .arg(-1)
                    .cmd("LLEN")
                    .arg(topic)
                    .query_async(&mut conn)
                    .await?;
                Ok(ReplayWindow { entries, cursor })
            })
        }
    }
}
