//! In-process pub/sub keyed by source id.
//!
//! Every published event is appended to the event table first (the returned
//! sequence number becomes the SSE event id), log lines are mirrored into the
//! quick-test / campaign log tables, and only then is the event offered to
//! subscribers. A subscriber whose buffer is full loses the new event; the
//! publisher never blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use stream_event::{ControlEvent, SourceId};

use crate::error::KittError;
use crate::store::{LogEntry, Store};

/// Per-subscriber buffer capacity.
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// One event as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct BusEvent {
    pub seq: u64,
    pub source: SourceId,
    pub ts: DateTime<Utc>,
    pub event: ControlEvent,
}

struct Subscriber {
    id: u64,
    filter: Option<SourceId>,
    tx: mpsc::Sender<BusEvent>,
}

struct Shared {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

pub struct EventBus {
    store: Arc<dyn Store>,
    shared: Arc<Shared>,
    /// Serializes append + fan-out so per-source delivery order matches
    /// publication order even with concurrent publishers.
    publish_lock: Mutex<()>,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            shared: Arc::new(Shared {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
            publish_lock: Mutex::new(()),
        }
    }

    /// Publishes an event: persists it, mirrors log lines, fans out.
    /// Returns the assigned sequence number.
    pub fn publish(&self, source: &SourceId, event: ControlEvent) -> Result<u64, KittError> {
        let _guard = self
            .publish_lock
            .lock()
            .map_err(|_| KittError::Fatal("event bus lock poisoned".into()))?;
        let ts = Utc::now();
        let payload = event
            .to_value()
            .map_err(|e| KittError::Validation(format!("event payload: {e}")))?;
        let seq =
            self.store
                .append_event(event.kind(), &source.to_string(), &payload.to_string())?;

        if let Some(line) = event.log_line() {
            let entry = LogEntry {
                ts,
                line: line.to_string(),
            };
            match source {
                SourceId::QuickTest(id) => {
                    self.store
                        .append_quick_test_logs(id, std::slice::from_ref(&entry))?;
                }
                SourceId::Campaign(id) => {
                    self.store.append_campaign_log(id, &entry)?;
                }
                _ => {}
            }
        }

        let bus_event = BusEvent {
            seq,
            source: source.clone(),
            ts,
            event,
        };
        let subscribers = self
            .shared
            .subscribers
            .read()
            .map_err(|_| KittError::Fatal("event bus lock poisoned".into()))?;
        for sub in subscribers.iter() {
            if let Some(filter) = &sub.filter {
                if filter != source {
                    continue;
                }
            }
            if sub.tx.try_send(bus_event.clone()).is_err() {
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    subscriber = sub.id,
                    dropped,
                    "subscriber buffer full, event dropped"
                );
            }
        }
        Ok(seq)
    }

    /// Subscribes to all events, or to one source when `filter` is given.
    /// Dropping the subscription unsubscribes.
    pub fn subscribe(&self, filter: Option<SourceId>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.shared.subscribers.write() {
            subs.push(Subscriber { id, filter, tx });
        }
        Subscription {
            id,
            shared: Arc::clone(&self.shared),
            rx,
        }
    }

    /// Stored log lines for a source, so late subscribers can catch up before
    /// the live tail. Non-log sources have no history.
    pub fn replay(&self, source: &SourceId) -> Result<Vec<LogEntry>, KittError> {
        match source {
            SourceId::QuickTest(id) => Ok(self.store.quick_test_logs(id)?),
            SourceId::Campaign(id) => Ok(self.store.campaign_logs(id)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Total events dropped on full subscriber buffers since startup.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

pub struct Subscription {
    id: u64,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<BusEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subs) = self.shared.subscribers.write() {
            subs.retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    fn bus() -> (tempfile::TempDir, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("kitt.db")).unwrap();
        store.migrate().unwrap();
        (dir, EventBus::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn per_source_order_is_preserved() {
        let (_dir, bus) = bus();
        let source = SourceId::QuickTest("qt-1".into());
        let mut sub = bus.subscribe(Some(source.clone()));
        for i in 0..10 {
            bus.publish(
                &source,
                ControlEvent::Log {
                    line: format!("line {i}"),
                },
            )
            .unwrap();
        }
        let mut last_seq = 0;
        for i in 0..10 {
            let ev = sub.recv().await.unwrap();
            assert!(ev.seq > last_seq);
            last_seq = ev.seq;
            assert_eq!(ev.event.log_line().unwrap(), format!("line {i}"));
        }
    }

    #[tokio::test]
    async fn scoped_subscriber_ignores_other_sources() {
        let (_dir, bus) = bus();
        let qt = SourceId::QuickTest("qt-1".into());
        let other = SourceId::Campaign("c-1".into());
        let mut sub = bus.subscribe(Some(qt.clone()));
        bus.publish(
            &other,
            ControlEvent::CampaignStatus {
                status: "running".into(),
            },
        )
        .unwrap();
        bus.publish(&qt, ControlEvent::Log { line: "hit".into() }).unwrap();
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.source, qt);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn log_lines_are_persisted_for_replay() {
        let (_dir, bus) = bus();
        let qt = SourceId::QuickTest("qt-9".into());
        bus.publish(&qt, ControlEvent::Log { line: "loading".into() }).unwrap();
        bus.publish(&qt, ControlEvent::Log { line: "ready".into() }).unwrap();
        // Status events are not log lines and leave no replay history.
        bus.publish(
            &qt,
            ControlEvent::Status {
                status: "running".into(),
                error: None,
            },
        )
        .unwrap();
        let lines = bus.replay(&qt).unwrap();
        assert_eq!(
            lines.iter().map(|l| l.line.as_str()).collect::<Vec<_>>(),
            vec!["loading", "ready"]
        );
    }

    #[tokio::test]
    async fn laggard_loses_newest_without_blocking_publisher() {
        let (_dir, bus) = bus();
        let source = SourceId::Campaign("c-1".into());
        let _sub = bus.subscribe(Some(source.clone()));
        // Never drained: fill past capacity.
        for i in 0..(SUBSCRIBER_CAPACITY + 10) {
            bus.publish(
                &source,
                ControlEvent::Log {
                    line: format!("l{i}"),
                },
            )
            .unwrap();
        }
        assert_eq!(bus.dropped(), 10);
    }

    #[tokio::test]
    async fn dropped_subscription_unsubscribes() {
        let (_dir, bus) = bus();
        let source = SourceId::Campaign("c-2".into());
        let sub = bus.subscribe(None);
        drop(sub);
        bus.publish(
            &source,
            ControlEvent::CampaignStatus {
                status: "queued".into(),
            },
        )
        .unwrap();
        assert_eq!(bus.dropped(), 0);
    }
}
