//! In-process event bus feeding the WebSocket fan-out.
//!
//! Events are a tagged enum — one case per kind, no open payload maps.
//! Subscribers declare a project and topic filter at subscription time;
//! filtering happens on the receive side so the publish path stays a single
//! channel send. Slow subscribers lose oldest events and see a
//! `bus.overflow` notice instead of stalling producers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use atoll_core::types::JobState;

/// Bounded per-subscriber queue length.
pub const BUS_CAPACITY: usize = 1000;

/// Producers coalesce progress events to at most 2 Hz per job.
pub const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum EventKind {
    #[serde(rename = "job.state")]
    JobState { job_id: String, state: JobState, error: Option<String> },
    #[serde(rename = "job.progress")]
    JobProgress { job_id: String, phase: String, fraction: f64, detail: Option<String> },
    #[serde(rename = "crawl.page")]
    CrawlPage { session_id: String, url: String, depth: usize, status: u16 },
    #[serde(rename = "retrieval.timing")]
    RetrievalTiming { latency_ms: u64, collections: usize, results: usize },
    #[serde(rename = "store.stats")]
    StoreStats { collections: usize, chunks: usize },
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "bus.overflow")]
    Overflow { dropped: u64 },
}

impl EventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::JobState { .. } => "job.state",
            EventKind::JobProgress { .. } => "job.progress",
            EventKind::CrawlPage { .. } => "crawl.page",
            EventKind::RetrievalTiming { .. } => "retrieval.timing",
            EventKind::StoreStats { .. } => "store.stats",
            EventKind::Error { .. } => "error",
            EventKind::Overflow { .. } => "bus.overflow",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Absent for process-global events (e.g. overflow notices).
    pub project_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event. Send errors (no live subscribers) are fine.
    pub fn publish(&self, project_id: Option<&str>, kind: EventKind) {
        let event =
            Event { project_id: project_id.map(str::to_string), kind, ts: Utc::now() };
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        Subscription { rx: self.tx.subscribe(), filter }
    }
}

/// What a subscriber wants to see. Empty topics = every topic; no project =
/// every project. Process-global events are delivered to everyone.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub project: Option<String>,
    pub topics: Vec<String>,
}

impl SubscriptionFilter {
    fn matches(&self, event: &Event) -> bool {
        if let (Some(want), Some(got)) = (&self.project, &event.project_id) {
            if want != got {
                return false;
            }
        }
        self.topics.is_empty() || self.topics.iter().any(|t| t == event.kind.topic())
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: SubscriptionFilter,
}

impl Subscription {
    /// Next matching event, or `None` once the bus shuts down. Falling
    /// behind yields a synthesized `bus.overflow` event in-stream.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    return Some(Event {
                        project_id: None,
                        kind: EventKind::Overflow { dropped },
                        ts: Utc::now(),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Progress coalescing
// ---------------------------------------------------------------------------

/// Producer-side rate limiter for `job.progress`. Phase changes and the
/// terminal 100% always pass; within a phase, emissions are spaced by
/// [`PROGRESS_MIN_INTERVAL`].
pub struct ProgressCoalescer {
    last_phase: String,
    last_emit: Option<Instant>,
}

impl Default for ProgressCoalescer {
    fn default() -> Self {
        ProgressCoalescer { last_phase: String::new(), last_emit: None }
    }
}

impl ProgressCoalescer {
    pub fn should_emit(&mut self, phase: &str, fraction: f64) -> bool {
        let phase_changed = phase != self.last_phase;
        let due = self
            .last_emit
            .map(|t| t.elapsed() >= PROGRESS_MIN_INTERVAL)
            .unwrap_or(true);

        if phase_changed || fraction >= 1.0 || due {
            self.last_phase = phase.to_string();
            self.last_emit = Some(Instant::now());
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_event(project: Option<&str>) -> EventKind {
        let _ = project;
        EventKind::JobState { job_id: "j1".into(), state: JobState::Running, error: None }
    }

    #[tokio::test]
    async fn topic_and_project_filtering() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter {
            project: Some("p1".into()),
            topics: vec!["job.state".into()],
        });

        bus.publish(Some("p2"), job_event(Some("p2"))); // wrong project
        bus.publish(
            Some("p1"),
            EventKind::RetrievalTiming { latency_ms: 3, collections: 1, results: 0 },
        ); // wrong topic
        bus.publish(Some("p1"), job_event(Some("p1"))); // match

        let got = sub.recv().await.unwrap();
        assert_eq!(got.kind.topic(), "job.state");
        assert_eq!(got.project_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn global_events_reach_scoped_subscribers() {
        let bus = EventBus::new();
        let mut sub =
            bus.subscribe(SubscriptionFilter { project: Some("p1".into()), topics: vec![] });
        bus.publish(None, EventKind::Error { code: "store.fatal".into(), message: "x".into() });
        assert_eq!(sub.recv().await.unwrap().kind.topic(), "error");
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_overflow() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter::default());
        for _ in 0..(BUS_CAPACITY + 10) {
            bus.publish(None, job_event(None));
        }
        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind.topic(), "bus.overflow");
    }

    #[test]
    fn coalescer_passes_phase_changes_and_completion() {
        let mut c = ProgressCoalescer::default();
        assert!(c.should_emit("chunking", 0.1));
        assert!(!c.should_emit("chunking", 0.2), "same phase, too soon");
        assert!(c.should_emit("embedding", 0.3), "phase change passes");
        assert!(c.should_emit("embedding", 1.0), "completion always passes");
    }
}
