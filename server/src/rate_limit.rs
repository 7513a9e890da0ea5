//! Rate limiting module for MatchMates server
//!
//! Implements sliding window rate limiting per user and action type

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Types of actions that can be rate limited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    DirectMessage,
    GroupMessage,
    FriendRequest,
    MatchSearch,
}

impl ActionType {
    /// Get the default rate limit for this action type (requests per minute)
    pub fn default_limit(&self) -> usize {
        match self {
            ActionType::DirectMessage => 30,
            ActionType::GroupMessage => 30,
            ActionType::FriendRequest => 10,
            ActionType::MatchSearch => 20,
        }
    }

    /// Get the time window for this action type
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Error returned when rate limit is exceeded
#[derive(Debug, thiserror::Error)]
#[error("Rate limit exceeded: {message}")]
pub struct RateLimitError {
    pub message: String,
    pub retry_after_secs: u64,
}

/// Rate limiter using sliding window algorithm
#[derive(Debug)]
pub struct RateLimiter {
    /// Tracks timestamps of actions per (user_id, action_type)
    windows: Arc<RwLock<HashMap<(Uuid, ActionType), VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record an action, or refuse it if the user's window is full
    pub async fn check(&self, user_id: Uuid, action: ActionType) -> Result<(), RateLimitError> {
        let mut windows = self.windows.write().await;
        let now = Instant::now();
        let window_duration = action.window_duration();
        let limit = action.default_limit();

        let window = windows.entry((user_id, action)).or_default();
        evict_expired(window, now, window_duration);

        if window.len() >= limit {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = window_duration
                .saturating_sub(now.duration_since(oldest))
                .as_secs();

            return Err(RateLimitError {
                message: format!(
                    "{:?} rate limit exceeded. Limit: {} per minute",
                    action, limit
                ),
                retry_after_secs: retry_after,
            });
        }

        window.push_back(now);
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_expired(window: &mut VecDeque<Instant>, now: Instant, window_duration: Duration) {
    while let Some(&front_time) = window.front() {
        if now.duration_since(front_time) > window_duration {
            window.pop_front();
        } else {
            break;
        }
    }
}
