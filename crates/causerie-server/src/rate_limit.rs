//! Message and new-chat throughput limits.
//!
//! Two tiers: short burst windows over the sender's own messages, and
//! rolling quotas over a longer timeframe. Counting happens in the store;
//! this module only holds the thresholds and compares.

use causerie_shared::UserId;
use causerie_store::Database;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::ValidationError;

pub const MESSAGE_RATE_LIMIT_EXCEEDED: &str =
    "user has exceeded the maximum number of new messages";
pub const NEW_CHAT_RATE_LIMIT_EXCEEDED: &str =
    "An invited user has exceeded the maximum number of new chats";

/// At most `max` messages in the trailing `secs` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstWindow {
    pub secs: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub timeframe_hours: i64,
    pub max_messages: i64,
    pub max_messages_per_recipient: i64,
    pub max_new_chats: i64,
    pub burst: Vec<BurstWindow>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            timeframe_hours: 24,
            max_messages: 2000,
            max_messages_per_recipient: 1000,
            max_new_chats: 100_000,
            burst: vec![
                BurstWindow { secs: 1, max: 10 },
                BurstWindow { secs: 10, max: 70 },
                BurstWindow { secs: 60, max: 300 },
            ],
        }
    }
}

/// Parse `secs:max` pairs separated by commas, e.g. `1:10,10:70`.
pub fn parse_burst(windows: &str) -> Result<Vec<BurstWindow>, String> {
    windows
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (secs, max) = part
                .trim()
                .split_once(':')
                .ok_or_else(|| format!("expected secs:max, got {part:?}"))?;
            let secs = secs
                .trim()
                .parse::<i64>()
                .map_err(|e| format!("bad window {secs:?}: {e}"))?;
            let max = max
                .trim()
                .parse::<i64>()
                .map_err(|e| format!("bad limit {max:?}: {e}"))?;
            if secs <= 0 {
                return Err(format!("window must be positive, got {secs}"));
            }
            Ok(BurstWindow { secs, max })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn cursor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.config.timeframe_hours)
    }

    /// Check whether `user` may send one more message into `chat_id`.
    pub fn check_message(
        &self,
        db: &Database,
        user: UserId,
        chat_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        for window in &self.config.burst {
            let count = db.count_messages_since(user, now - Duration::seconds(window.secs))?;
            if count >= window.max {
                warn!(
                    window_secs = window.secs,
                    user_id = user.0,
                    count,
                    "Message rate limit exceeded"
                );
                return Err(ValidationError::RateLimited(
                    MESSAGE_RATE_LIMIT_EXCEEDED.to_string(),
                ));
            }
        }

        let cursor = self.cursor(now);
        let total = db.count_messages_since(user, cursor)?;
        if total >= self.config.max_messages {
            info!(user_id = user.0, chat_id, total, "Hit rate limit (total new messages)");
            return Err(ValidationError::RateLimited(
                MESSAGE_RATE_LIMIT_EXCEEDED.to_string(),
            ));
        }

        let in_chat = db.count_messages_in_chat_since(user, chat_id, cursor)?;
        if in_chat >= self.config.max_messages_per_recipient {
            info!(user_id = user.0, chat_id, in_chat, "Hit rate limit (new messages per recipient)");
            return Err(ValidationError::RateLimited(
                MESSAGE_RATE_LIMIT_EXCEEDED.to_string(),
            ));
        }

        Ok(())
    }

    /// Check that none of the invited users has hit the new-chat quota.
    pub fn check_new_chat(
        &self,
        db: &Database,
        users: &[UserId],
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let max = db.max_new_chats_since(users, self.cursor(now))?;
        if max >= self.config.max_new_chats {
            info!(?users, max, "Hit rate limit (new chats)");
            return Err(ValidationError::RateLimited(
                NEW_CHAT_RATE_LIMIT_EXCEEDED.to_string(),
            ));
        }
        Ok(())
    }
}
