// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Pipeline
//!
//! Shared consumption logic for both consumer modes. Every delivery is
//! registered with the outstanding-work tracker before its handler runs, so
//! shutdown draining is mode-agnostic. Subscribe handlers only acknowledge;
//! rpc handlers additionally validate the inbound routing key against their
//! registration patterns and publish the handler's reply back to the
//! requester.

use crate::{
    codec::PayloadCodec,
    errors::AmqpError,
    handler::{AmqpMessage, ConsumerHandler, HandlerOptions, HandlerResponse, Payload},
    otel,
    policy::ErrorBehavior,
    registry::ConsumerMode,
    routing,
    topology::{self, declare_queue},
    tracker::WorkTracker,
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Consumer,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Everything one running consumer needs to process deliveries.
pub(crate) struct ConsumerContext {
    pub channel: Channel,
    pub queue: String,
    pub mode: ConsumerMode,
    pub handler: Arc<dyn ConsumerHandler>,
    pub options: HandlerOptions,
    pub codec: Arc<dyn PayloadCodec>,
    pub tracker: Arc<WorkTracker>,
    /// Error policy after per-handler/default resolution
    pub error_behavior: ErrorBehavior,
}

/// How a processed delivery is settled at the channel level.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliveryVerdict {
    Ack,
    Nack { requeue: bool },
    /// Publish this value to the requester's reply queue, then ack
    Reply(Value),
}

/// Runs the shared queue-setup routine and opens the consumer.
///
/// Declares the queue (or passively checks it when the registration forbids
/// creation), binds every configured routing key, then starts consuming with
/// a broker-generated tag.
pub(crate) async fn setup_consumer(
    channel: &Channel,
    options: &HandlerOptions,
) -> Result<(String, String, Consumer), AmqpError> {
    let queue_name = declare_queue(
        channel,
        &options.queue,
        QueueDeclareOptions {
            passive: !options.create_queue_if_not_exists,
            durable: options.queue_options.durable,
            exclusive: options.queue_options.exclusive,
            auto_delete: options.queue_options.auto_delete,
            nowait: false,
        },
        topology::field_table(&options.queue_options.arguments),
        options.queue_options.conflict_policy,
    )
    .await?;

    if !options.exchange.is_empty() {
        for routing_key in &options.routing_keys {
            channel
                .queue_bind(
                    &queue_name,
                    &options.exchange,
                    routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error binding queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        options.exchange.clone(),
                        queue_name.clone(),
                    )
                })?;
        }
    }

    let consumer = channel
        .basic_consume(
            &queue_name,
            "",
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error creating consumer");
            AmqpError::BindingConsumerError(queue_name.clone())
        })?;

    let tag = consumer.tag().to_string();
    debug!(
        queue = queue_name.as_str(),
        tag = tag.as_str(),
        "consumer started"
    );

    Ok((tag, queue_name, consumer))
}

/// Spawns the dispatch loop for one consumer.
///
/// Deliveries are processed on their own tasks, so one channel runs up to
/// its prefetch limit of handlers concurrently. Each task holds a tracker
/// guard from before the handler is invoked until it settles, which is what
/// shutdown drains on.
pub(crate) fn spawn_dispatch(mut consumer: Consumer, ctx: Arc<ConsumerContext>) {
    tokio::spawn(async move {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    let guard = ctx.tracker.register();
                    let ctx = Arc::clone(&ctx);

                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(err) = process_delivery(&ctx, Some(delivery)).await {
                            error!(error = err.to_string(), "error consuming message");
                        }
                    });
                }
                Err(err) => {
                    error!(error = err.to_string(), "error receiving delivery");
                }
            }
        }

        // Stream end means the consumer was cancelled, by us or the broker.
        debug!(queue = ctx.queue.as_str(), "consumer stream ended");
    });
}

/// Processes one delivery end to end: guard checks, decode, invoke, settle.
pub(crate) async fn process_delivery(
    ctx: &ConsumerContext,
    delivery: Option<Delivery>,
) -> Result<(), AmqpError> {
    // Should not occur under normal broker semantics; checked so a broken
    // consumer loop no-ops instead of crashing.
    let Some(delivery) = delivery else {
        debug!(error = AmqpError::NullMessage.to_string(), "skipping");
        return Ok(());
    };

    let tracer = global::tracer("amqp consumer");
    let (otel_ctx, mut span) = otel::consumer_span(&delivery.properties, &tracer, &ctx.queue);

    let routing_key = delivery.routing_key.to_string();
    debug!(
        queue = ctx.queue.as_str(),
        routing_key = routing_key.as_str(),
        exchange = delivery.exchange.to_string(),
        "message received"
    );

    // Guards rpc registrations sharing infrastructure against cross-talk.
    if ctx.mode == ConsumerMode::Rpc
        && !routing::matches_any(&routing_key, &ctx.options.routing_keys)
    {
        warn!(
            queue = ctx.queue.as_str(),
            routing_key = routing_key.as_str(),
            "rpc delivery does not match the registered patterns, rejecting"
        );
        span.set_status(Status::Error {
            description: Cow::from("routing key mismatch"),
        });
        return nack(&delivery, false).await;
    }

    let payload = match ctx.codec.deserialize(&delivery.data) {
        Ok(value) => Payload::Json(value),
        Err(_) if ctx.options.allow_non_json_messages => {
            debug!("payload not decodable, passing raw bytes through");
            Payload::Raw(delivery.data.clone())
        }
        Err(err) => {
            error!(error = err.to_string(), "error decoding payload");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error decoding payload"),
            });
            return settle(ctx, &delivery, failure_verdict(ctx.error_behavior), span).await;
        }
    };

    let message = AmqpMessage {
        queue: ctx.queue.clone(),
        exchange: delivery.exchange.to_string(),
        routing_key,
        payload,
        redelivered: delivery.redelivered,
        headers: delivery.properties.headers().clone(),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.to_string()),
    };

    let result = ctx.handler.handle(&otel_ctx, &message).await;
    let verdict = resolve_verdict(ctx.mode, result, ctx.error_behavior);
    settle(ctx, &delivery, verdict, span).await
}

/// Maps the handler outcome to a channel-level settlement.
pub(crate) fn resolve_verdict(
    mode: ConsumerMode,
    result: Result<HandlerResponse, AmqpError>,
    error_behavior: ErrorBehavior,
) -> DeliveryVerdict {
    match result {
        Ok(HandlerResponse::Ack) => DeliveryVerdict::Ack,
        Ok(HandlerResponse::Nack { requeue }) => DeliveryVerdict::Nack { requeue },
        Ok(HandlerResponse::Reply(value)) => match mode {
            ConsumerMode::Rpc => DeliveryVerdict::Reply(value),
            ConsumerMode::Subscribe => {
                warn!("subscribe handler returned a reply value, acking anyway");
                DeliveryVerdict::Ack
            }
        },
        Err(err) => {
            error!(
                error = err.to_string(),
                "handler failed, applying error policy"
            );
            failure_verdict(error_behavior)
        }
    }
}

fn failure_verdict(error_behavior: ErrorBehavior) -> DeliveryVerdict {
    if error_behavior.acks() {
        DeliveryVerdict::Ack
    } else {
        DeliveryVerdict::Nack {
            requeue: error_behavior.requeue(),
        }
    }
}

async fn settle(
    ctx: &ConsumerContext,
    delivery: &Delivery,
    verdict: DeliveryVerdict,
    mut span: opentelemetry::global::BoxedSpan,
) -> Result<(), AmqpError> {
    let result = match verdict {
        DeliveryVerdict::Ack => ack(delivery).await,
        DeliveryVerdict::Nack { requeue } => nack(delivery, requeue).await,
        DeliveryVerdict::Reply(value) => {
            publish_reply(ctx, delivery, &value).await?;
            ack(delivery).await
        }
    };

    match &result {
        Ok(_) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("error settling message"),
            });
        }
    }

    result
}

/// Publishes an rpc reply to the empty exchange under the requester's
/// reply-to routing key, propagating correlation id, expiration and headers.
async fn publish_reply(
    ctx: &ConsumerContext,
    delivery: &Delivery,
    value: &Value,
) -> Result<(), AmqpError> {
    let Some(reply_to) = delivery.properties.reply_to() else {
        warn!("rpc delivery carries no reply-to, dropping the reply");
        return Ok(());
    };

    let body = ctx.codec.serialize(value)?;

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(ctx.codec.content_type()));
    if let Some(correlation_id) = delivery.properties.correlation_id() {
        properties = properties.with_correlation_id(correlation_id.clone());
    }
    if let Some(expiration) = delivery.properties.expiration() {
        properties = properties.with_expiration(expiration.clone());
    }
    if let Some(headers) = delivery.properties.headers() {
        properties = properties.with_headers(headers.clone());
    }

    ctx.channel
        .basic_publish(
            "",
            reply_to.as_str(),
            BasicPublishOptions::default(),
            &body,
            properties,
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error publishing rpc reply");
            AmqpError::PublishingError
        })?;

    Ok(())
}

async fn ack(delivery: &Delivery) -> Result<(), AmqpError> {
    delivery
        .ack(BasicAckOptions { multiple: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error acking message");
            AmqpError::AckMessageError
        })
}

async fn nack(delivery: &Delivery, requeue: bool) -> Result<(), AmqpError> {
    delivery
        .nack(BasicNackOptions {
            multiple: false,
            requeue,
        })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error nacking message");
            AmqpError::NackMessageError
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockConsumerHandler;
    use opentelemetry::Context;
    use serde_json::json;

    fn message() -> AmqpMessage {
        AmqpMessage {
            queue: "orders".to_owned(),
            exchange: "commerce".to_owned(),
            routing_key: "order.placed".to_owned(),
            payload: Payload::Json(json!({ "id": 1 })),
            redelivered: false,
            headers: None,
            correlation_id: None,
        }
    }

    async fn run_handler(handler: &MockConsumerHandler) -> Result<HandlerResponse, AmqpError> {
        handler.handle(&Context::current(), &message()).await
    }

    #[tokio::test]
    async fn successful_subscribe_handler_acks() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Ok(HandlerResponse::Ack));

        let verdict = resolve_verdict(
            ConsumerMode::Subscribe,
            run_handler(&handler).await,
            ErrorBehavior::Nack,
        );
        assert_eq!(verdict, DeliveryVerdict::Ack);
    }

    #[tokio::test]
    async fn rpc_reply_is_published_then_acked() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Ok(HandlerResponse::Reply(json!({ "ok": true }))));

        let verdict = resolve_verdict(
            ConsumerMode::Rpc,
            run_handler(&handler).await,
            ErrorBehavior::Nack,
        );
        assert_eq!(verdict, DeliveryVerdict::Reply(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn subscribe_handler_returning_a_reply_is_misuse_but_still_acks() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Ok(HandlerResponse::Reply(json!("unexpected"))));

        let verdict = resolve_verdict(
            ConsumerMode::Subscribe,
            run_handler(&handler).await,
            ErrorBehavior::Nack,
        );
        assert_eq!(verdict, DeliveryVerdict::Ack);
    }

    #[tokio::test]
    async fn nack_response_propagates_the_requeue_flag() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Ok(HandlerResponse::Nack { requeue: true }));

        let verdict = resolve_verdict(
            ConsumerMode::Rpc,
            run_handler(&handler).await,
            ErrorBehavior::Nack,
        );
        assert_eq!(verdict, DeliveryVerdict::Nack { requeue: true });
    }

    #[tokio::test]
    async fn handler_errors_follow_the_resolved_policy() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Err(AmqpError::InternalError));

        let result = run_handler(&handler).await;
        assert_eq!(
            resolve_verdict(ConsumerMode::Subscribe, result, ErrorBehavior::Ack),
            DeliveryVerdict::Ack
        );

        let result = run_handler(&handler).await;
        assert_eq!(
            resolve_verdict(ConsumerMode::Subscribe, result, ErrorBehavior::Nack),
            DeliveryVerdict::Nack { requeue: false }
        );

        let result = run_handler(&handler).await;
        assert_eq!(
            resolve_verdict(ConsumerMode::Subscribe, result, ErrorBehavior::RequeueNack),
            DeliveryVerdict::Nack { requeue: true }
        );
    }

    #[tokio::test]
    async fn requeue_policy_yields_requeue_until_the_handler_succeeds() {
        // Fails twice, succeeds on the third invocation; verifies the exact
        // settlement sequence, not just the end state.
        let mut handler = MockConsumerHandler::new();
        let mut invocations = 0;
        handler.expect_handle().returning(move |_, _| {
            invocations += 1;
            if invocations < 3 {
                Err(AmqpError::InternalError)
            } else {
                Ok(HandlerResponse::Ack)
            }
        });

        let mut verdicts = vec![];
        for _ in 0..3 {
            verdicts.push(resolve_verdict(
                ConsumerMode::Subscribe,
                run_handler(&handler).await,
                ErrorBehavior::RequeueNack,
            ));
        }

        assert_eq!(
            verdicts,
            vec![
                DeliveryVerdict::Nack { requeue: true },
                DeliveryVerdict::Nack { requeue: true },
                DeliveryVerdict::Ack,
            ]
        );
    }
}
