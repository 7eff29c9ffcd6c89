use std::time::Duration;

use anyhow::Context;
use ::redis::{aio::ConnectionManager, Script};

use super::{CacheFuture, CodeCache};

// INCR and set the window TTL only when this call created the key.
const INCREMENT_WITH_TTL: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

/// Redis-backed code cache. `ConnectionManager` reconnects on its own and is
/// cheap to clone per command.
#[derive(Clone)]
pub struct RedisCodeCache {
    connection: ConnectionManager,
    increment_script: Script,
}

impl RedisCodeCache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = ::redis::Client::open(redis_url).context("failed to create redis client")?;
        let connection =
            ConnectionManager::new(client).await.context("failed to connect to redis")?;

        Ok(Self { connection, increment_script: Script::new(INCREMENT_WITH_TTL) })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .context("redis ping failed")?;
        Ok(())
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl CodeCache for RedisCodeCache {
    fn set_with_ttl<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_seconds(ttl))
                .query_async::<_, ()>(&mut connection)
                .await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let value = ::redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut connection)
                .await?;
            Ok(value)
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            // NX replies nil when the key already exists.
            let created = ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds(ttl))
                .query_async::<_, Option<String>>(&mut connection)
                .await?;
            Ok(created.is_some())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            ::redis::cmd("DEL").arg(key).query_async::<_, i64>(&mut connection).await?;
            Ok(())
        })
    }

    fn take<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let value = ::redis::cmd("GETDEL")
                .arg(key)
                .query_async::<_, Option<String>>(&mut connection)
                .await?;
            Ok(value)
        })
    }

    fn increment<'a>(&'a self, key: &'a str, ttl_on_create: Duration) -> CacheFuture<'a, i64> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let value = self
                .increment_script
                .key(key)
                .arg(ttl_seconds(ttl_on_create))
                .invoke_async::<_, i64>(&mut connection)
                .await?;
            Ok(value)
        })
    }
}
