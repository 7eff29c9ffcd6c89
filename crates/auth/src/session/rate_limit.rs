use std::{sync::Arc, time::Duration};

use crate::cache::{CacheError, CodeCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Per-email throttle for password reset requests: a short cooldown flag plus
/// an attempt counter whose window starts at the first attempt. Rejected
/// attempts still count.
#[derive(Clone)]
pub struct ForgotPasswordLimiter {
    cache: Arc<dyn CodeCache>,
    cooldown: Duration,
    max_attempts: i64,
    window: Duration,
}

impl ForgotPasswordLimiter {
    pub fn new(
        cache: Arc<dyn CodeCache>,
        cooldown: Duration,
        max_attempts: i64,
        window: Duration,
    ) -> Self {
        Self { cache, cooldown, max_attempts, window }
    }

    /// Claims one reset attempt. The cooldown flag is taken with an atomic
    /// create and the cap is judged on the value the increment returns, so
    /// concurrent requests for one email cannot all pass.
    pub async fn acquire(&self, email: &str) -> Result<RateLimitDecision, CacheError> {
        if !self.cache.set_if_absent(&cooldown_key(email), "1", self.cooldown).await? {
            return Ok(RateLimitDecision::Limited);
        }

        let attempts = self.cache.increment(&attempts_key(email), self.window).await?;
        if attempts > self.max_attempts {
            return Ok(RateLimitDecision::Limited);
        }
        Ok(RateLimitDecision::Allowed)
    }

    pub async fn clear(&self, email: &str) -> Result<(), CacheError> {
        self.cache.delete(&cooldown_key(email)).await?;
        self.cache.delete(&attempts_key(email)).await?;
        Ok(())
    }
}

fn cooldown_key(email: &str) -> String {
    format!("forgot:cooldown:{email}")
}

fn attempts_key(email: &str) -> String {
    format!("forgot:attempts:{email}")
}
