//! Progress event bus.
//!
//! Publishing never blocks and never fails deliberation: with no
//! subscribers the event is dropped, and a subscriber that falls more than
//! [`CHANNEL_CAPACITY`] events behind loses the oldest ones.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::types::ProgressEvent;

/// Events buffered per subscriber before it starts lagging.
pub const CHANNEL_CAPACITY: usize = 256;

pub type SharedEventBus = Arc<EventBus>;

/// Engine-wide broadcast of [`ProgressEvent`]s for every session.
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    pub fn publish(&self, event: ProgressEvent) {
        let session_id = event.session_id().to_string();
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => debug!(%session_id, event_type, receivers, "Progress event"),
            Err(_) => trace!(%session_id, event_type, "Progress event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side selection over the shared stream. An empty filter
/// matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub session_id: Option<String>,
    pub sub_problem: Option<usize>,
    pub event_types: Option<Vec<String>>,
    /// Only events after which a session stops doing work.
    pub finals_only: bool,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Restrict to events about one sub-problem. Session-level events
    /// never match.
    pub fn sub_problem(mut self, index: usize) -> Self {
        self.sub_problem = Some(index);
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn finals(mut self) -> Self {
        self.finals_only = true;
        self
    }

    pub fn matches(&self, event: &ProgressEvent) -> bool {
        if self
            .session_id
            .as_deref()
            .is_some_and(|id| id != event.session_id())
        {
            return false;
        }
        if self.sub_problem.is_some() && event.sub_problem() != self.sub_problem {
            return false;
        }
        if self.finals_only && !event.is_final() {
            return false;
        }
        match &self.event_types {
            Some(types) => types.iter().any(|t| t == event.event_type()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn started(id: &str) -> ProgressEvent {
        ProgressEvent::SessionStarted {
            session_id: id.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn round(id: &str, sub_problem: usize) -> ProgressEvent {
        ProgressEvent::RoundComplete {
            session_id: id.to_string(),
            sub_problem,
            round: 1,
            exploration: 0.5,
            convergence: 0.2,
            focus: 0.9,
            novelty: 1.0,
            decision: "continue".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(started("s-1"));
        bus.publish(round("s-1", 0));
        assert_eq!(rx.recv().await.unwrap().event_type(), "session_started");
        assert_eq!(rx.recv().await.unwrap().event_type(), "round_complete");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(started("s-1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..4 {
            bus.publish(round("s-1", i));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap().sub_problem(), Some(2));
    }

    #[test]
    fn test_filter_by_session_and_type() {
        let filter = EventFilter::new().session("s-1").types(vec!["session_started"]);
        assert!(filter.matches(&started("s-1")));
        assert!(!filter.matches(&started("s-2")));
        assert!(!filter.matches(&round("s-1", 0)));
    }

    #[test]
    fn test_filter_by_sub_problem() {
        let filter = EventFilter::new().sub_problem(1);
        assert!(filter.matches(&round("s-1", 1)));
        assert!(!filter.matches(&round("s-1", 0)));
        assert!(!filter.matches(&started("s-1")));
    }

    #[test]
    fn test_filter_finals() {
        let filter = EventFilter::new().finals();
        assert!(!filter.matches(&round("s-1", 0)));
        assert!(filter.matches(&ProgressEvent::Killed {
            session_id: "s-1".into(),
            timestamp: Utc::now(),
        }));
    }
}
