// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Error Policy
//!
//! Maps a named behavior to the channel-level outcome applied when a consumer
//! handler fails. Every handler failure ends in exactly one of ack, nack or
//! nack-with-requeue; there is no path that leaves a message unacknowledged.

use serde::{Deserialize, Serialize};

/// Behavior applied to a delivery whose handler returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorBehavior {
    /// Acknowledge the message, dropping it from the queue
    Ack,
    /// Reject the message without requeueing
    #[default]
    Nack,
    /// Reject the message and ask the broker to redeliver it
    RequeueNack,
}

impl ErrorBehavior {
    /// Picks the per-handler override when configured, else the connection
    /// default for the consumer mode.
    pub fn resolve(overridden: Option<ErrorBehavior>, default: ErrorBehavior) -> ErrorBehavior {
        overridden.unwrap_or(default)
    }

    /// Whether this behavior acknowledges instead of rejecting.
    pub(crate) fn acks(&self) -> bool {
        matches!(self, ErrorBehavior::Ack)
    }

    /// Requeue flag passed to the broker when this behavior rejects.
    pub(crate) fn requeue(&self) -> bool {
        matches!(self, ErrorBehavior::RequeueNack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_default() {
        assert_eq!(
            ErrorBehavior::resolve(Some(ErrorBehavior::Ack), ErrorBehavior::Nack),
            ErrorBehavior::Ack
        );
        assert_eq!(
            ErrorBehavior::resolve(None, ErrorBehavior::RequeueNack),
            ErrorBehavior::RequeueNack
        );
    }

    #[test]
    fn requeue_flag_follows_behavior() {
        assert!(!ErrorBehavior::Nack.requeue());
        assert!(ErrorBehavior::RequeueNack.requeue());
        assert!(ErrorBehavior::Ack.acks());
        assert!(!ErrorBehavior::Nack.acks());
    }

    #[test]
    fn deserializes_from_kebab_case() {
        let behavior: ErrorBehavior = serde_json::from_str("\"requeue-nack\"").unwrap();
        assert_eq!(behavior, ErrorBehavior::RequeueNack);
    }
}
