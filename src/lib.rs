// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;
mod publisher;
mod registry;
mod topology;

pub mod channels;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod manager;
pub mod policy;
pub mod queue;
pub mod routing;
pub mod tracker;

pub use manager::{ConnectionManager, ConnectionState, RequestOptions};
pub use publisher::HeaderValue;
pub use registry::ConsumerMode;
