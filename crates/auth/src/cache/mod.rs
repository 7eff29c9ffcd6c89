//! Ephemeral key-value cache for verification codes and rate-limit counters.
//!
//! Every key carries a TTL. `take`, `set_if_absent` and `increment` must be
//! atomic per key so concurrent requests for the same email cannot both redeem
//! one code or both pass a rate limit.

pub mod memory;
pub mod redis;

use std::{future::Future, pin::Pin, time::Duration};

use thiserror::Error;

pub use self::memory::MemoryCodeCache;
pub use self::redis::RedisCodeCache;

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache command failed: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("cache returned unexpected data: {0}")]
    Unexpected(String),
}

pub trait CodeCache: Send + Sync {
    fn set_with_ttl<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration)
        -> CacheFuture<'a, ()>;

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Atomic create. Returns `false` when a live value already holds the key,
    /// so exactly one concurrent caller gets `true`.
    fn set_if_absent<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration)
        -> CacheFuture<'a, bool>;

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()>;

    /// Atomic get-and-delete. At most one caller observes a given value.
    fn take<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Atomic increment returning the new value. The TTL is applied only when
    /// the key is created by this call.
    fn increment<'a>(&'a self, key: &'a str, ttl_on_create: Duration) -> CacheFuture<'a, i64>;
}
