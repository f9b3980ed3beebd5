//! Redis backend.
//!
//! A [`RedisStore`] owns one dedicated connection. `WATCH` state lives on
//! that connection, so give each concurrently running lock handle its own
//! store rather than sharing one.

use super::{ExecOutcome, Store, Ttl, TxOp};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct RedisStore {
    url: String,
    conn: Mutex<::redis::aio::MultiplexedConnection>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("url", &self.url).finish()
    }
}

impl RedisStore {
    /// Open a fresh connection to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            url: url.to_string(),
            conn: Mutex::new(conn),
        })
    }

    async fn query<T: ::redis::FromRedisValue>(&self, cmd: &::redis::Cmd) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let value: T = cmd.query_async(&mut *conn).await?;
        Ok(value)
    }
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl Store for RedisStore {
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        self.query(::redis::cmd("SETNX").arg(key).arg(value)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.query(::redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(::redis::cmd("GET").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.query(::redis::cmd("PEXPIRE").arg(key).arg(millis(ttl))).await
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        let ms: i64 = self.query(::redis::cmd("PTTL").arg(key)).await?;
        Ok(match ms {
            -2 => Ttl::Missing,
            -1 => Ttl::Persistent,
            ms => Ttl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.query(::redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query(::redis::cmd("INCR").arg(key)).await
    }

    async fn watch(&self, key: &str) -> Result<()> {
        self.query(::redis::cmd("WATCH").arg(key)).await
    }

    async fn unwatch(&self) -> Result<()> {
        self.query(&::redis::cmd("UNWATCH")).await
    }

    async fn exec(&self, ops: Vec<TxOp>) -> Result<ExecOutcome> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                TxOp::Del(key) => pipe.cmd("DEL").arg(key).ignore(),
                TxOp::Expire(key, ttl) => pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl)).ignore(),
                TxOp::Set(key, value) => pipe.cmd("SET").arg(key).arg(value).ignore(),
            };
        }

        // EXEC replies nil when a watched key changed
        let mut conn = self.conn.lock().await;
        let reply: Option<Vec<::redis::Value>> = pipe.query_async(&mut *conn).await?;
        Ok(match reply {
            Some(_) => ExecOutcome::Committed,
            None => ExecOutcome::Aborted,
        })
    }
}
