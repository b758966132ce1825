//! Bounded, TTL-keyed cache of per-topic minimum in-sync-replica config.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admin::TopicConfig;
use crate::now_ms;

/// A cached MinISR value and when it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinIsrWithTime {
    pub min_isr: u32,
    pub observed_at_ms: u64,
}

/// Cache of per-topic `min.insync.replicas`, bounded by entry count and
/// swept by observation age.
#[derive(Debug)]
pub struct TopicMinIsrCache {
    inner: RwLock<BTreeMap<String, MinIsrWithTime>>,
    capacity: usize,
    retention_ms: u64,
}

impl TopicMinIsrCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
            retention_ms: retention.as_millis() as u64,
        }
    }

    pub fn put(&self, topic: impl Into<String>, min_isr: u32, now_ms: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(
            topic.into(),
            MinIsrWithTime {
                min_isr,
                observed_at_ms: now_ms,
            },
        );
        Self::enforce_capacity(&mut inner, self.capacity);
    }

    /// Merge a `describe_topic_configs` response into the cache.
    pub fn put_topic_configs(&self, configs: &BTreeMap<String, TopicConfig>, now_ms: u64) {
        let mut inner = self.inner.write().unwrap();
        for (topic, config) in configs {
            inner.insert(
                topic.clone(),
                MinIsrWithTime {
                    min_isr: config.min_insync_replicas,
                    observed_at_ms: now_ms,
                },
            );
        }
        Self::enforce_capacity(&mut inner, self.capacity);
    }

    pub fn min_isr_by_topic(&self) -> BTreeMap<String, MinIsrWithTime> {
        self.inner.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Drop entries older than the retention window.
    pub fn evict_expired(&self, now_ms: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.retain(|_, e| e.observed_at_ms + self.retention_ms >= now_ms);
    }

    fn enforce_capacity(entries: &mut BTreeMap<String, MinIsrWithTime>, capacity: usize) {
        while entries.len() > capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.observed_at_ms)
                .map(|(t, _)| t.clone());
            match oldest {
                Some(topic) => {
                    entries.remove(&topic);
                }
                None => break,
            }
        }
    }
}

/// Spawn the periodic cache sweeper.
pub fn spawn_cleaner(
    cache: Arc<TopicMinIsrCache>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            cache.evict_expired(now_ms());
        }
    })
}
