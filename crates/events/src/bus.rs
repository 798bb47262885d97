//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`BuildEvent`]s. It is
//! designed to be shared via `Arc<EventBus>` between the dispatcher (the
//! only publisher) and the web layer (any number of subscribers).
//!
//! Publishing never depends on subscribers: the dispatcher persists every
//! line itself, and a subscriber attaching or detaching has no effect on
//! delivery to the others.

use archery_core::build::BuildStatus;
use archery_core::log_stream::{EventChannel, OutputChannel};
use archery_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

// ---------------------------------------------------------------------------
// BuildEvent
// ---------------------------------------------------------------------------

/// One entry of a build's event stream.
///
/// For `std`/`err` the text is a single completed output line and `seq` is
/// its position among the build's lines, counting from zero in the order
/// they were stored. For `finish` the text is the terminal status name and
/// `seq` is the number of lines the run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub build_id: DbId,
    pub seq: u64,
    pub channel: EventChannel,
    pub text: String,
}

impl BuildEvent {
    /// A completed output line.
    pub fn line(
        build_id: DbId,
        seq: u64,
        channel: OutputChannel,
        text: impl Into<String>,
    ) -> Self {
        Self {
            build_id,
            seq,
            channel: channel.into(),
            text: text.into(),
        }
    }

    /// The terminal transition of a build that produced `line_count` lines.
    pub fn finish(build_id: DbId, status: BuildStatus, line_count: u64) -> Self {
        Self {
            build_id,
            seq: line_count,
            channel: EventChannel::Finish,
            text: status.as_str().to_string(),
        }
    }

    pub fn is_finish(&self) -> bool {
        self.channel == EventChannel::Finish
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`BuildEvent`].
///
/// # Usage
///
/// ```rust
/// use archery_core::log_stream::OutputChannel;
/// use archery_events::bus::{BuildEvent, EventBus};
///
/// let bus = EventBus::default();
/// let _sub = bus.subscribe_build(7);
///
/// bus.publish(BuildEvent::line(7, 0, OutputChannel::Std, "==> Making package"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<BuildEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: BuildEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the events of every build.
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single build.
    pub fn subscribe_build(&self, build_id: DbId) -> BuildSubscription {
        BuildSubscription {
            build_id,
            receiver: self.sender.subscribe(),
            next_seq: None,
            held: None,
        }
    }

    /// Number of live receivers (all builds).
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// BuildSubscription
// ---------------------------------------------------------------------------

/// What a [`BuildSubscription`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(BuildEvent),
    /// Lines from `from_seq` onward were dropped by the bus. Reload them
    /// from the log store, then call [`BuildSubscription::caught_up`].
    Missed { from_seq: u64 },
}

/// Receiver filtered to one build id. Dropping it detaches the subscriber.
///
/// Lines are delivered in `seq` order without repeats. The first event
/// received fixes the starting point; after that a skipped `seq` or a
/// broadcast lag is reported as [`Delivery::Missed`] instead of being
/// passed over silently.
pub struct BuildSubscription {
    build_id: DbId,
    receiver: broadcast::Receiver<BuildEvent>,
    next_seq: Option<u64>,
    held: Option<BuildEvent>,
}

impl BuildSubscription {
    pub fn build_id(&self) -> DbId {
        self.build_id
    }

    /// Wait for the next delivery for this build.
    ///
    /// Returns `None` once the bus has been dropped. `finish` is always
    /// delivered, after any gap before it has been reported.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if let Some(event) = self.held.take() {
            // Its gap was reported already; lines the reload did not cover
            // are not reported twice.
            if event.is_finish() || self.next_seq.map_or(true, |next| event.seq >= next) {
                self.advance(&event);
                return Some(Delivery::Event(event));
            }
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) if event.build_id == self.build_id => match self.next_seq {
                    Some(next) if event.seq > next => {
                        self.held = Some(event);
                        return Some(Delivery::Missed { from_seq: next });
                    }
                    Some(next) if event.seq < next && !event.is_finish() => continue,
                    _ => {
                        self.advance(&event);
                        return Some(Delivery::Event(event));
                    }
                },
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        build_id = self.build_id,
                        skipped,
                        "Build event subscriber lagged, reporting gap",
                    );
                    return Some(Delivery::Missed {
                        from_seq: self.next_seq.unwrap_or(0),
                    });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Record that every line before `next_seq` reached the subscriber by
    /// other means. Later events for those lines are skipped.
    pub fn caught_up(&mut self, next_seq: u64) {
        self.next_seq = Some(self.next_seq.map_or(next_seq, |n| n.max(next_seq)));
    }

    fn advance(&mut self, event: &BuildEvent) {
        if !event.is_finish() {
            self.next_seq = Some(event.seq + 1);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn std_line(build_id: DbId, seq: u64) -> BuildEvent {
        BuildEvent::line(build_id, seq, OutputChannel::Std, format!("line {seq}"))
    }

    async fn next_event(sub: &mut BuildSubscription) -> BuildEvent {
        match sub.recv().await.expect("bus still open") {
            Delivery::Event(event) => event,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(BuildEvent::line(42, 0, OutputChannel::Err, "warning: foo"));

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.build_id, 42);
        assert_eq!(received.channel, EventChannel::Err);
        assert_eq!(received.text, "warning: foo");
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe_build(1);
        let mut rx2 = bus.subscribe_build(1);

        bus.publish(BuildEvent::finish(1, BuildStatus::Success, 0));

        let e1 = next_event(&mut rx1).await;
        let e2 = next_event(&mut rx2).await;

        assert!(e1.is_finish());
        assert_eq!(e1, e2);
        assert_eq!(e1.text, "success");
    }

    #[tokio::test]
    async fn build_subscription_filters_other_builds() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_build(2);

        bus.publish(BuildEvent::line(1, 0, OutputChannel::Std, "not mine"));
        bus.publish(BuildEvent::line(2, 0, OutputChannel::Std, "mine"));

        let event = next_event(&mut sub).await;
        assert_eq!(event.text, "mine");
        assert_eq!(sub.build_id(), 2);
    }

    #[tokio::test]
    async fn detaching_does_not_affect_other_subscribers() {
        let bus = EventBus::default();
        let detached = bus.subscribe_build(3);
        let mut kept = bus.subscribe_build(3);
        assert_eq!(bus.subscriber_count(), 2);

        drop(detached);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(BuildEvent::line(3, 0, OutputChannel::Std, "still delivered"));
        let event = next_event(&mut kept).await;
        assert_eq!(event.text, "still delivered");
    }

    #[tokio::test]
    async fn subscription_ends_when_bus_is_dropped() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_build(4);

        drop(bus);

        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_joining_mid_build_starts_at_first_seen_line() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_build(5);

        bus.publish(std_line(5, 40));
        bus.publish(std_line(5, 41));

        assert_eq!(next_event(&mut sub).await.seq, 40);
        assert_eq!(next_event(&mut sub).await.seq, 41);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_where_the_gap_starts() {
        let bus = EventBus::new(1024);
        let mut sub = bus.subscribe_build(1);

        bus.publish(std_line(1, 0));
        assert_eq!(next_event(&mut sub).await.seq, 0);

        for seq in 1..1500 {
            bus.publish(std_line(1, seq));
        }

        assert_eq!(sub.recv().await, Some(Delivery::Missed { from_seq: 1 }));

        // Lines 1..=600 reloaded from the store; retained events up to
        // there are skipped, the rest continue in order.
        sub.caught_up(601);
        assert_eq!(next_event(&mut sub).await.seq, 601);
        assert_eq!(next_event(&mut sub).await.seq, 602);
    }

    #[tokio::test]
    async fn lag_before_first_event_reports_gap_from_start() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_build(6);

        for seq in 0..5 {
            bus.publish(std_line(6, seq));
        }
        bus.publish(BuildEvent::finish(6, BuildStatus::Success, 5));

        assert_eq!(sub.recv().await, Some(Delivery::Missed { from_seq: 0 }));
        sub.caught_up(5);

        let event = next_event(&mut sub).await;
        assert!(event.is_finish());
    }

    #[tokio::test]
    async fn skipped_seq_is_reported_before_the_later_line() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_build(7);

        bus.publish(std_line(7, 0));
        bus.publish(std_line(7, 3));
        bus.publish(std_line(7, 4));

        assert_eq!(next_event(&mut sub).await.seq, 0);
        assert_eq!(sub.recv().await, Some(Delivery::Missed { from_seq: 1 }));

        // Nothing could be reloaded: the held line is delivered anyway.
        assert_eq!(next_event(&mut sub).await.seq, 3);
        assert_eq!(next_event(&mut sub).await.seq, 4);
    }

    #[tokio::test]
    async fn finish_waits_for_missing_lines() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_build(8);

        bus.publish(std_line(8, 0));
        bus.publish(BuildEvent::finish(8, BuildStatus::Error, 3));

        assert_eq!(next_event(&mut sub).await.seq, 0);
        assert_eq!(sub.recv().await, Some(Delivery::Missed { from_seq: 1 }));
        sub.caught_up(3);

        let event = next_event(&mut sub).await;
        assert!(event.is_finish());
        assert_eq!(event.text, "error");
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        // No subscribers; this must not panic.
        bus.publish(BuildEvent::finish(9, BuildStatus::Error, 0));
    }

    #[test]
    fn event_serializes_with_lowercase_channel() {
        let json =
            serde_json::to_value(BuildEvent::finish(7, BuildStatus::Cancelled, 12)).unwrap();
        assert_eq!(json["build_id"], 7);
        assert_eq!(json["seq"], 12);
        assert_eq!(json["channel"], "finish");
        assert_eq!(json["text"], "cancelled");
    }
}
