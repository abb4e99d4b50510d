//! Union configuration.

use crate::error::{Result, UnionError};
use crate::types::Timestamp;
use std::time::Duration;

/// Configuration for a union.
#[derive(Clone, Debug)]
pub struct UnionConfig {
    /// Width of a time partition.
    /// Default: 5 minutes
    pub last_subscribed_interval: Duration,

    /// Oldest accepted non-zero `last_subscribed`.
    /// Default: 180 days
    pub last_subscribed_maximum_age: Duration,
}

impl Default for UnionConfig {
    fn default() -> Self {
        Self {
            last_subscribed_interval: Duration::from_secs(5 * 60),
            last_subscribed_maximum_age: Duration::from_secs(180 * 24 * 60 * 60),
        }
    }
}

impl UnionConfig {
    /// Partition key of a `last_subscribed` time.
    pub fn discrete_last_subscribed(&self, last_subscribed: Timestamp) -> Timestamp {
        last_subscribed.floor_to(self.last_subscribed_interval)
    }

    /// Reject a `last_subscribed` older than the maximum age.
    pub fn check_last_subscribed(&self, last_subscribed: Timestamp, now: Timestamp) -> Result<()> {
        if !last_subscribed.is_never()
            && now.saturating_sub(self.last_subscribed_maximum_age) > last_subscribed
        {
            return Err(UnionError::LastSubscribedTooOld(last_subscribed));
        }
        Ok(())
    }
}
