// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Registry
//!
//! Named, independently-configured channels multiplexed over one physical
//! connection. A handle survives reconnects: the supervisor refills its
//! channel slot and replays prefetch setup every time the transport comes
//! back, so the rest of the crate only ever resolves handles by name.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{options::BasicQosOptions, Channel, Connection};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Name given to the implicit channel synthesized when no configured channel
/// is flagged default
pub const DEFAULT_CHANNEL_NAME: &str = "default";

/// One named channel over the physical connection.
///
/// The slot is empty until the connection reaches `Ready` and is cleared on
/// disconnect; accessing it in between yields `ChannelNotAvailable`.
pub struct ChannelHandle {
    name: String,
    prefetch_count: u16,
    slot: RwLock<Option<Channel>>,
}

impl ChannelHandle {
    fn new(name: &str, prefetch_count: u16) -> Arc<ChannelHandle> {
        Arc::new(ChannelHandle {
            name: name.to_owned(),
            prefetch_count,
            slot: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    /// Returns the current channel, failing before `Ready` or while
    /// disconnected.
    pub async fn current(&self) -> Result<Channel, AmqpError> {
        self.slot
            .read()
            .await
            .clone()
            .ok_or_else(|| AmqpError::ChannelNotAvailable(self.name.clone()))
    }

    /// Opens a fresh channel on `connection` and applies this handle's
    /// prefetch, replacing whatever the slot held.
    pub(crate) async fn reopen(&self, connection: &Connection) -> Result<Channel, AmqpError> {
        let channel = connection.create_channel().await.map_err(|err| {
            error!(
                error = err.to_string(),
                channel = self.name.as_str(),
                "error creating channel"
            );
            AmqpError::ChannelNotAvailable(self.name.clone())
        })?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    channel = self.name.as_str(),
                    "error configuring qos"
                );
                AmqpError::QoSDeclarationError(self.name.clone())
            })?;

        debug!(
            channel = self.name.as_str(),
            prefetch = self.prefetch_count,
            "channel opened"
        );

        *self.slot.write().await = Some(channel.clone());
        Ok(channel)
    }

    /// Empties the slot after a disconnect.
    pub(crate) async fn clear(&self) {
        *self.slot.write().await = None;
    }
}

/// Registry of the named channels configured for one connection.
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<ChannelHandle>>,
    default_name: String,
}

impl ChannelRegistry {
    /// Builds the registry from configuration.
    ///
    /// Exactly one channel ends up default: a single `default: true` entry
    /// wins, zero flagged entries synthesize an implicit `"default"` channel
    /// with the connection-wide prefetch, and more than one flagged entry is
    /// a configuration error.
    pub fn from_config(config: &AmqpConfig) -> Result<ChannelRegistry, AmqpError> {
        let mut channels = HashMap::new();
        let mut default_name = None;

        for (name, channel_config) in &config.channels {
            if channel_config.default {
                if let Some(existing) = &default_name {
                    return Err(AmqpError::ChannelConfig(format!(
                        "both `{existing}` and `{name}` are flagged default"
                    )));
                }
                default_name = Some(name.clone());
            }

            let prefetch = channel_config.prefetch_count.unwrap_or(config.prefetch_count);
            channels.insert(name.clone(), ChannelHandle::new(name, prefetch));
        }

        let default_name = match default_name {
            Some(name) => name,
            None => {
                channels
                    .entry(DEFAULT_CHANNEL_NAME.to_owned())
                    .or_insert_with(|| {
                        ChannelHandle::new(DEFAULT_CHANNEL_NAME, config.prefetch_count)
                    });
                DEFAULT_CHANNEL_NAME.to_owned()
            }
        };

        Ok(ChannelRegistry {
            channels,
            default_name,
        })
    }

    /// The channel operations use when none is named.
    pub fn default_channel(&self) -> Arc<ChannelHandle> {
        Arc::clone(&self.channels[&self.default_name])
    }

    /// Resolves a channel by name.
    ///
    /// An unknown name falls back to the default channel with a warning
    /// instead of failing the registration.
    pub fn resolve(&self, name: Option<&str>) -> Arc<ChannelHandle> {
        match name {
            None => self.default_channel(),
            Some(name) => match self.channels.get(name) {
                Some(handle) => Arc::clone(handle),
                None => {
                    warn!(
                        channel = name,
                        "unknown channel name, falling back to the default channel"
                    );
                    self.default_channel()
                }
            },
        }
    }

    /// Iterates over every registered handle.
    pub fn all(&self) -> impl Iterator<Item = &Arc<ChannelHandle>> {
        self.channels.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    #[test]
    fn synthesizes_an_implicit_default_channel() {
        let config = AmqpConfig::new("amqp://localhost");
        let registry = ChannelRegistry::from_config(&config).unwrap();

        assert_eq!(registry.default_channel().name(), DEFAULT_CHANNEL_NAME);
        assert_eq!(
            registry.default_channel().prefetch_count(),
            config.prefetch_count
        );
    }

    #[test]
    fn flagged_channel_becomes_the_default() {
        let config = AmqpConfig::new("amqp://localhost")
            .channel(
                "bulk",
                ChannelConfig {
                    prefetch_count: Some(100),
                    default: false,
                },
            )
            .channel(
                "serial",
                ChannelConfig {
                    prefetch_count: Some(1),
                    default: true,
                },
            );

        let registry = ChannelRegistry::from_config(&config).unwrap();
        assert_eq!(registry.default_channel().name(), "serial");
        assert_eq!(registry.default_channel().prefetch_count(), 1);
    }

    #[test]
    fn two_defaults_are_a_configuration_error() {
        let config = AmqpConfig::new("amqp://localhost")
            .channel(
                "a",
                ChannelConfig {
                    prefetch_count: None,
                    default: true,
                },
            )
            .channel(
                "b",
                ChannelConfig {
                    prefetch_count: None,
                    default: true,
                },
            );

        assert!(matches!(
            ChannelRegistry::from_config(&config),
            Err(AmqpError::ChannelConfig(_))
        ));
    }

    #[test]
    fn unknown_name_falls_back_to_the_default_channel() {
        let config = AmqpConfig::new("amqp://localhost").channel(
            "serial",
            ChannelConfig {
                prefetch_count: Some(1),
                default: true,
            },
        );

        let registry = ChannelRegistry::from_config(&config).unwrap();
        assert_eq!(registry.resolve(Some("typo")).name(), "serial");
        assert_eq!(registry.resolve(Some("serial")).name(), "serial");
        assert_eq!(registry.resolve(None).name(), "serial");
    }
}
