// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Records every active consumer so it can be cancelled, resumed and
//! restored after a reconnect. Records are exclusively owned here; the
//! connection manager only passes tags around. The map lock is never held
//! across an await, keeping registration and swap atomic with respect to
//! concurrently running consumer callbacks.

use crate::handler::{ConsumerHandler, HandlerOptions};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Consumer flavor: fire-and-forget subscribe or request/reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Subscribe,
    Rpc,
}

/// Everything needed to re-create a consumer: its handler, options and the
/// resolved channel it is attached to.
#[derive(Clone)]
pub(crate) struct ConsumerRecord {
    pub tag: String,
    pub mode: ConsumerMode,
    pub handler: Arc<dyn ConsumerHandler>,
    pub options: HandlerOptions,
    /// Channel name after default-fallback resolution
    pub channel_name: String,
}

/// Registry of active consumers, keyed by consumer tag.
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    records: Mutex<HashMap<String, ConsumerRecord>>,
}

impl ConsumerRegistry {
    pub(crate) fn insert(&self, record: ConsumerRecord) {
        self.records
            .lock()
            .expect("consumer registry lock poisoned")
            .insert(record.tag.clone(), record);
    }

    pub(crate) fn get(&self, tag: &str) -> Option<ConsumerRecord> {
        self.records
            .lock()
            .expect("consumer registry lock poisoned")
            .get(tag)
            .cloned()
    }

    pub(crate) fn remove(&self, tag: &str) -> Option<ConsumerRecord> {
        self.records
            .lock()
            .expect("consumer registry lock poisoned")
            .remove(tag)
    }

    /// Replaces `old_tag` with a re-created record in one critical section,
    /// so no lookup can observe the consumer as missing mid-resume.
    pub(crate) fn swap(&self, old_tag: &str, record: ConsumerRecord) {
        let mut records = self
            .records
            .lock()
            .expect("consumer registry lock poisoned");
        records.remove(old_tag);
        records.insert(record.tag.clone(), record);
    }

    /// Clones every record, for setup replay after a reconnect.
    pub(crate) fn snapshot(&self) -> Vec<ConsumerRecord> {
        self.records
            .lock()
            .expect("consumer registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Removes and returns every record, for shutdown.
    pub(crate) fn drain(&self) -> Vec<ConsumerRecord> {
        self.records
            .lock()
            .expect("consumer registry lock poisoned")
            .drain()
            .map(|(_, record)| record)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records
            .lock()
            .expect("consumer registry lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerResponse, MockConsumerHandler};

    fn record(tag: &str) -> ConsumerRecord {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Ok(HandlerResponse::Ack));

        ConsumerRecord {
            tag: tag.to_owned(),
            mode: ConsumerMode::Subscribe,
            handler: Arc::new(handler),
            options: HandlerOptions::default(),
            channel_name: "default".to_owned(),
        }
    }

    #[test]
    fn swap_replaces_the_tag_atomically() {
        let registry = ConsumerRegistry::default();
        registry.insert(record("old-tag"));

        registry.swap("old-tag", record("new-tag"));

        assert_eq!(registry.len(), 1);
        assert!(registry.remove("old-tag").is_none());
        assert!(registry.remove("new-tag").is_some());
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = ConsumerRegistry::default();
        registry.insert(record("a"));
        registry.insert(record("b"));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 0);
    }
}
