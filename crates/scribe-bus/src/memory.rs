//! In-process bus for single-process wiring and tests.
//!
//! Messages live in one ordered vector (a single partition, `0`), so the
//! bus is neither durable nor shared across processes. Committed group
//! positions are kept on the bus, so a re-created subscription resumes
//! where its group left off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use scribe_types::Envelope;
use tokio::sync::Notify;

use crate::error::{BusError, PublishError};
use crate::port::{Delivery, EventBus, Subscription};

#[derive(Default)]
struct Inner {
    log: Mutex<Vec<Delivery>>,
    groups: Mutex<HashMap<(String, String), i64>>,
    appended: Notify,
    fail_next: AtomicUsize,
    unavailable: AtomicBool,
}

/// An in-memory [`EventBus`] with fault injection.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("in-memory bus lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` publishes fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Toggles a simulated outage. While unavailable every publish fails.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// All messages published so far, in order.
    pub fn messages(&self) -> Vec<Delivery> {
        lock(&self.inner.log).clone()
    }

    /// Decoded envelopes published to `topic`, in order.
    pub fn envelopes(&self, topic: &str) -> Vec<Envelope> {
        lock(&self.inner.log)
            .iter()
            .filter(|d| d.topic == topic)
            .filter_map(|d| Envelope::from_wire(&d.value).ok())
            .collect()
    }

    /// Opens a subscription for `group` on `topic`.
    pub fn subscribe(&self, group: &str, topic: &str) -> MemorySubscription {
        let position = lock(&self.inner.groups)
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0);
        MemorySubscription {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            topic: topic.to_string(),
            position,
        }
    }

    /// Appends a raw message, bypassing envelope encoding.
    ///
    /// Lets tests feed consumers values no producer would write.
    pub fn append_raw(&self, topic: &str, key: &[u8], value: &[u8]) -> i64 {
        let offset = {
            let mut log = lock(&self.inner.log);
            let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
            log.push(Delivery {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: key.to_vec(),
                value: value.to_vec(),
            });
            offset
        };
        self.inner.appended.notify_waiters();
        offset
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("in-memory bus is offline".into()));
        }
        if self.take_injected_failure() {
            return Err(PublishError::Transport("injected publish failure".into()));
        }

        let value = envelope.to_wire()?;
        let offset = self.append_raw(topic, envelope.key(), &value);
        tracing::trace!(topic, offset, event_id = %envelope.event_id, "appended to in-memory bus");
        Ok(())
    }
}

/// Subscription over an [`InMemoryBus`].
pub struct MemorySubscription {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    position: i64,
}

impl MemorySubscription {
    fn next_message(&mut self) -> Option<Delivery> {
        let log = lock(&self.inner.log);
        let start = usize::try_from(self.position).unwrap_or(usize::MAX);
        let found = log
            .iter()
            .skip(start)
            .find(|d| d.topic == self.topic)
            .cloned();
        match &found {
            Some(d) => self.position = d.offset + 1,
            None => self.position = i64::try_from(log.len()).unwrap_or(i64::MAX),
        }
        found
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        let deadline = tokio::time::Instant::now() + wait;
        let inner = Arc::clone(&self.inner);
        loop {
            let appended = inner.appended.notified();
            if let Some(delivery) = self.next_message() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let mut groups = lock(&self.inner.groups);
        let committed = groups
            .entry((self.group.clone(), self.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(delivery.offset + 1);
        Ok(())
    }

    async fn rewind(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.position = delivery.offset;
        Ok(())
    }
}
