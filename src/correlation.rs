// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Correlation Bus
//!
//! In-memory broadcast stream of inbound reply messages, keyed by correlation
//! id. The direct reply-to consumer publishes every reply onto the bus; each
//! pending `request` call filters its own subscription for the matching id.
//! Replies arriving after the requester settled find no subscriber filter
//! willing to take them and are dropped.

use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the reply broadcast channel. A lagged requester skips the
/// overwritten replies and keeps filtering.
const BUS_CAPACITY: usize = 256;

/// One reply received on the direct reply-to pseudo-queue.
#[derive(Debug, Clone)]
pub struct CorrelationMessage {
    pub correlation_id: String,
    /// Secondary id disambiguating replies when several logical requests
    /// share one correlation id scheme
    pub request_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Broadcast bus resolving outstanding RPC calls.
pub struct CorrelationBus {
    sender: broadcast::Sender<CorrelationMessage>,
}

impl Default for CorrelationBus {
    fn default() -> Self {
        CorrelationBus::new()
    }
}

impl CorrelationBus {
    pub fn new() -> CorrelationBus {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        CorrelationBus { sender }
    }

    /// Publishes a reply to every pending subscription.
    ///
    /// A reply without any live subscriber is dropped, which is the fate of
    /// duplicates and of replies arriving after their request timed out.
    pub fn publish(&self, message: CorrelationMessage) {
        if self.sender.send(message).is_err() {
            debug!("reply dropped, no pending request is subscribed");
        }
    }

    /// Opens a subscription covering every reply published from now on.
    ///
    /// Subscribe before publishing the request so the reply cannot win the
    /// race against the subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<CorrelationMessage> {
        self.sender.subscribe()
    }

    /// Filters a subscription down to the reply matching `correlation_id`
    /// and, when given, `request_id`.
    ///
    /// Resolves at most once; the caller bounds it with a timeout. Lagged
    /// receivers skip overwritten replies and keep filtering.
    pub async fn await_reply(
        mut receiver: broadcast::Receiver<CorrelationMessage>,
        correlation_id: &str,
        request_id: Option<&str>,
    ) -> CorrelationMessage {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if message.correlation_id != correlation_id {
                        continue;
                    }
                    if request_id.is_some() && message.request_id.as_deref() != request_id {
                        continue;
                    }
                    return message;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "correlation subscription lagged");
                }
                // Bus dropped mid-request; park until the caller's timeout
                // settles the race.
                Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reply(correlation_id: &str, request_id: Option<&str>, payload: &[u8]) -> CorrelationMessage {
        CorrelationMessage {
            correlation_id: correlation_id.to_owned(),
            request_id: request_id.map(str::to_owned),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn resolves_the_matching_correlation_id() {
        let bus = CorrelationBus::new();
        let subscription = bus.subscribe();

        bus.publish(reply("other", None, b"wrong"));
        bus.publish(reply("mine", None, b"right"));

        let message = CorrelationBus::await_reply(subscription, "mine", None).await;
        assert_eq!(message.payload, b"right");
    }

    #[tokio::test]
    async fn concurrent_requests_each_resolve_their_own_reply() {
        let bus = CorrelationBus::new();

        let waiters: Vec<_> = (0..8)
            .map(|i| {
                let subscription = bus.subscribe();
                tokio::spawn(async move {
                    CorrelationBus::await_reply(subscription, &format!("req-{i}"), None).await
                })
            })
            .collect();

        // Replies arrive out of issuance order.
        for i in (0..8).rev() {
            bus.publish(reply(&format!("req-{i}"), None, format!("body-{i}").as_bytes()));
        }

        for (i, waiter) in waiters.into_iter().enumerate() {
            let message = waiter.await.unwrap();
            assert_eq!(message.payload, format!("body-{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn request_id_disambiguates_shared_correlation_ids() {
        let bus = CorrelationBus::new();
        let subscription = bus.subscribe();

        bus.publish(reply("shared", Some("other-request"), b"wrong"));
        bus.publish(reply("shared", None, b"also wrong"));
        bus.publish(reply("shared", Some("this-request"), b"right"));

        let message =
            CorrelationBus::await_reply(subscription, "shared", Some("this-request")).await;
        assert_eq!(message.payload, b"right");
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_wait_is_settled_by_the_timeout_race() {
        let bus = CorrelationBus::new();
        let subscription = bus.subscribe();

        bus.publish(reply("someone-else", None, b"noise"));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            CorrelationBus::await_reply(subscription, "mine", None),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn late_reply_after_settlement_is_dropped() {
        let bus = CorrelationBus::new();
        // No live subscription: publish must not fail or leak.
        bus.publish(reply("expired", None, b"late"));
    }
}
