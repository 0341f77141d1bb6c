//! Fan-out of events to live subscribers.

use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::Event;
use crate::metrics::{EVENTS_PUBLISHED, SUBSCRIBER_LAGGED};

/// Broadcaster for engine events backed by a tokio broadcast channel.
///
/// Each subscriber reads from a bounded ring of `capacity` events. A
/// subscriber that falls behind loses the oldest events and is told how many
/// it missed; publishing never waits on a subscriber. Subscribers only see
/// events published after they subscribed.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<Event>,
}

impl EventBroadcaster {
    /// Create a new broadcaster with the given per-subscriber capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns the number of subscribers that will see it.
    pub fn publish(&self, event: Event) -> usize {
        EVENTS_PUBLISHED.inc();
        // An error only means no one is listening
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.sender.subscribe(),
            skipped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One item read from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Event(Event),
    /// The subscriber fell behind and this many events were dropped.
    Lagged(u64),
}

/// A single subscriber's view of the event stream.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    skipped: u64,
}

impl EventSubscription {
    /// Wait for the next item. `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Received> {
        match self.rx.recv().await {
            Ok(event) => Some(Received::Event(event)),
            Err(RecvError::Lagged(n)) => Some(self.lagged(n)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Wait for the next event, skipping over lag notices.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.recv().await? {
                Received::Event(event) => return Some(event),
                Received::Lagged(_) => continue,
            }
        }
    }

    /// Non-blocking read of an already buffered event.
    pub fn try_next_event(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    self.lagged(n);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total events this subscriber has lost to lag.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Adapt into a `Stream` of events, lag notices dropped.
    pub fn into_stream(self) -> impl Stream<Item = Event> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.next_event().await?;
            Some((event, sub))
        })
    }

    fn lagged(&mut self, n: u64) -> Received {
        tracing::warn!(skipped = n, "Event subscriber lagged, dropping oldest events");
        SUBSCRIBER_LAGGED.inc_by(n);
        self.skipped += n;
        Received::Lagged(n)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::batch::BatchId;
    use crate::events::{EventKind, EventLevel};

    fn log_event(batch_id: BatchId, message: &str) -> Event {
        Event::new(batch_id, EventLevel::Info, EventKind::Log, message)
    }

    #[tokio::test]
    async fn test_identical_events_are_not_deduplicated() {
        let broadcaster = EventBroadcaster::new(16);
        let mut sub = broadcaster.subscribe();
        let batch_id = BatchId::new();
        let event = log_event(batch_id, "same");

        broadcaster.publish(event.clone());
        broadcaster.publish(event.clone());

        assert_eq!(sub.next_event().await, Some(event.clone()));
        assert_eq!(sub.next_event().await, Some(event));
        assert!(sub.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let broadcaster = EventBroadcaster::new(16);
        let batch_id = BatchId::new();
        for i in 0..10 {
            broadcaster.publish(log_event(batch_id, &format!("event {}", i)));
        }

        let mut late = broadcaster.subscribe();
        assert!(late.try_next_event().is_none());

        broadcaster.publish(log_event(batch_id, "fresh"));
        let event = late.next_event().await.unwrap();
        assert_eq!(event.message, "fresh");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let broadcaster = EventBroadcaster::new(4);
        let mut slow = broadcaster.subscribe();
        let batch_id = BatchId::new();

        for i in 0..10 {
            broadcaster.publish(log_event(batch_id, &format!("event {}", i)));
        }

        match slow.recv().await {
            Some(Received::Lagged(n)) => assert_eq!(n, 6),
            other => panic!("expected lag notice, got {:?}", other),
        }
        assert_eq!(slow.skipped(), 6);

        let first = slow.next_event().await.unwrap();
        assert_eq!(first.message, "event 6");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let broadcaster = EventBroadcaster::new(2);
        for i in 0..100 {
            assert_eq!(broadcaster.publish(log_event(BatchId::new(), &i.to_string())), 0);
        }
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive_in_order() {
        let broadcaster = EventBroadcaster::new(16);
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();
        let batch_id = BatchId::new();

        for i in 0..3 {
            broadcaster.publish(log_event(batch_id, &i.to_string()));
        }
        drop(broadcaster);

        let a: Vec<String> = a.into_stream().map(|e| e.message).collect().await;
        let b: Vec<String> = b.into_stream().map(|e| e.message).collect().await;
        assert_eq!(a, vec!["0", "1", "2"]);
        assert_eq!(a, b);
    }
}
