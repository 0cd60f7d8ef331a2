use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::trace;

use crate::config::BrokerConfig;
use crate::llm::Role;

use super::event::{Event, EventKind};

/// Typed publish/subscribe with one topic per operation.
///
/// Producers never block: each subscriber owns a bounded queue, and an
/// overloaded subscriber loses its oldest events to a single `overflow`
/// marker rather than slowing the scheduler down. The last N events per
/// topic are retained so a late subscriber can replay from a sequence
/// number.
pub struct EventBroker {
    topics: Mutex<HashMap<String, Topic>>,
    config: BrokerConfig,
}

struct Topic {
    next_seq: u64,
    replay: VecDeque<Event>,
    subscribers: Vec<Arc<SubscriberQueue>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            next_seq: 0,
            replay: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }
}

struct SubscriberQueue {
    buf: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue preserving per-subscriber order. When full, the head of the
    /// queue is truncated and replaced by one overflow marker.
    fn push(&self, event: Event) {
        let mut buf = self.buf.lock();
        if buf.len() >= self.capacity {
            let drop_count = buf.len() / 2 + 1;
            let first_dropped_seq = buf.front().map(|e| e.seq).unwrap_or(event.seq);
            buf.drain(..drop_count);
            buf.push_front(Event {
                seq: first_dropped_seq,
                timestamp: Utc::now(),
                event: EventKind::Overflow,
                role: None,
                data: json!({ "dropped": drop_count }),
            });
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Live event stream for one subscriber. Single consumer.
pub struct EventStream {
    queue: Arc<SubscriberQueue>,
}

impl EventStream {
    /// Next event, in publication order. Returns `None` once the topic is
    /// closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.buf.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.buf.lock().pop_front()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::SeqCst);
    }
}

impl EventBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Publish an event on an operation's topic and return it with its
    /// assigned sequence number.
    pub fn emit(&self, op_id: &str, kind: EventKind, role: Option<Role>, data: Value) -> Event {
        let mut topics = self.topics.lock();
        let topic = topics
            .entry(op_id.to_string())
            .or_insert_with(Topic::new);

        let event = Event {
            seq: topic.next_seq,
            timestamp: Utc::now(),
            event: kind,
            role,
            data,
        };
        topic.next_seq += 1;

        topic.replay.push_back(event.clone());
        while topic.replay.len() > self.config.replay_buffer {
            topic.replay.pop_front();
        }

        topic
            .subscribers
            .retain(|s| !s.closed.load(Ordering::SeqCst));
        for subscriber in &topic.subscribers {
            subscriber.push(event.clone());
        }

        trace!(op_id, event = %kind, seq = event.seq, "event emitted");
        event
    }

    /// Subscribe to an operation's topic, optionally replaying retained
    /// events from a sequence number.
    pub fn subscribe(&self, op_id: &str, from_seq: Option<u64>) -> EventStream {
        let mut topics = self.topics.lock();
        let topic = topics
            .entry(op_id.to_string())
            .or_insert_with(Topic::new);

        let queue = Arc::new(SubscriberQueue::new(self.config.subscriber_queue));
        if let Some(from) = from_seq {
            for event in topic.replay.iter().filter(|e| e.seq >= from) {
                queue.push(event.clone());
            }
        }
        topic.subscribers.push(queue.clone());

        EventStream { queue }
    }

    /// Close an operation's topic: subscribers drain what they have and
    /// then see end-of-stream.
    pub fn close_topic(&self, op_id: &str) {
        let mut topics = self.topics.lock();
        if let Some(topic) = topics.get_mut(op_id) {
            for subscriber in &topic.subscribers {
                subscriber.close();
            }
            topic.subscribers.clear();
        }
    }

    /// Sequence number the next event on this topic will get.
    pub fn next_seq(&self, op_id: &str) -> u64 {
        self.topics
            .lock()
            .get(op_id)
            .map(|t| t.next_seq)
            .unwrap_or(0)
    }

    /// Retained events with `seq >= from`, for host-side inspection.
    pub fn replay(&self, op_id: &str, from_seq: u64) -> Vec<Event> {
        let topics = self.topics.lock();
        topics
            .get(op_id)
            .map(|t| {
                t.replay
                    .iter()
                    .filter(|e| e.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(queue: usize, replay: usize) -> EventBroker {
        EventBroker::new(BrokerConfig {
            subscriber_queue: queue,
            replay_buffer: replay,
        })
    }

    #[tokio::test]
    async fn per_subscriber_order_is_preserved() {
        let broker = broker(64, 64);
        let mut stream = broker.subscribe("op1", None);
        for i in 0..5 {
            broker.emit("op1", EventKind::Heartbeat, None, json!({ "i": i }));
        }
        for i in 0..5u64 {
            let event = stream.recv().await.unwrap();
            assert_eq!(event.seq, i);
        }
    }

    #[tokio::test]
    async fn overflow_truncates_head_with_marker() {
        let broker = broker(8, 64);
        let mut stream = broker.subscribe("op1", None);
        for _ in 0..20 {
            broker.emit("op1", EventKind::Heartbeat, None, Value::Null);
        }

        let first = stream.recv().await.unwrap();
        assert_eq!(first.event, EventKind::Overflow);
        assert!(first.data["dropped"].as_u64().unwrap() > 0);

        // Everything after the marker is still in order.
        let mut last_seq = first.seq;
        while let Some(event) = stream.try_recv() {
            assert!(event.seq >= last_seq);
            last_seq = event.seq;
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_from_seq() {
        let broker = broker(64, 64);
        for i in 0..10 {
            broker.emit("op1", EventKind::Heartbeat, None, json!({ "i": i }));
        }
        let mut stream = broker.subscribe("op1", Some(7));
        assert_eq!(stream.recv().await.unwrap().seq, 7);
        assert_eq!(stream.recv().await.unwrap().seq, 8);
        assert_eq!(stream.recv().await.unwrap().seq, 9);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let broker = broker(64, 64);
        let mut a = broker.subscribe("op-a", None);
        broker.emit("op-b", EventKind::Heartbeat, None, Value::Null);
        broker.emit("op-a", EventKind::Heartbeat, None, Value::Null);
        // Each topic numbers its own sequence.
        assert_eq!(a.recv().await.unwrap().seq, 0);
    }

    #[tokio::test]
    async fn closed_topic_ends_stream() {
        let broker = broker(64, 64);
        let mut stream = broker.subscribe("op1", None);
        broker.emit("op1", EventKind::Heartbeat, None, Value::Null);
        broker.close_topic("op1");
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }
}
