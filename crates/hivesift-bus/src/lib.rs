use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use hivesift_schema::QueryEvent;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Topic {
    StageChanged,
    Completed,
    Failed,
}

impl Topic {
    pub fn from_event(event: &QueryEvent) -> Self {
        match event {
            QueryEvent::StageChanged { .. } => Topic::StageChanged,
            QueryEvent::Completed { .. } => Topic::Completed,
            QueryEvent::Failed { .. } => Topic::Failed,
        }
    }

    pub const ALL: [Topic; 3] = [Topic::StageChanged, Topic::Completed, Topic::Failed];
}

type Subscriber = mpsc::Sender<QueryEvent>;

/// Topic-keyed fanout for query progress. Subscribers get their own
/// bounded channel; a slow subscriber drops events rather than stalling
/// the orchestrator.
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        subs.entry(topic).or_default().push(tx);
        rx
    }

    /// One receiver across every topic, preserving publish order.
    pub async fn subscribe_all(&self) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        for topic in Topic::ALL {
            subs.entry(topic).or_default().push(tx.clone());
        }
        rx
    }

    pub async fn publish(&self, event: QueryEvent) -> Result<()> {
        publish_to(&self.subscribers, event).await
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            subscribers: self.subscribers.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BusPublisher {
    subscribers: Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>,
}

impl BusPublisher {
    pub async fn publish(&self, event: QueryEvent) -> Result<()> {
        publish_to(&self.subscribers, event).await
    }
}

async fn publish_to(
    subscribers: &RwLock<HashMap<Topic, Vec<Subscriber>>>,
    event: QueryEvent,
) -> Result<()> {
    let topic = Topic::from_event(&event);
    let subs = subscribers.read().await;
    if let Some(subscribers) = subs.get(&topic) {
        for tx in subscribers {
            if tx.try_send(event.clone()).is_err() {
                tracing::debug!(?topic, "dropping event for saturated subscriber");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivesift_schema::{ErrorKind, QueryFailure, Stage};
    use tokio::time::{timeout, Duration};
    use uuid::Uuid;

    fn stage_event(stage: Stage) -> QueryEvent {
        QueryEvent::StageChanged {
            trace_id: Uuid::new_v4(),
            session_id: "s1".into(),
            stage,
            message: stage.to_string(),
            percent: stage.percent(),
        }
    }

    fn failed_event() -> QueryEvent {
        QueryEvent::Failed {
            trace_id: Uuid::new_v4(),
            failure: QueryFailure {
                stage: Stage::Analyzing,
                kind: ErrorKind::UnstructuredResponse,
                session_id: "s1".into(),
                hint: "retry".into(),
                detail: "model returned prose".into(),
            },
        }
    }

    #[tokio::test]
    async fn publish_to_no_subscribers_succeeds() {
        let bus = EventBus::new(8);
        assert!(bus.publish(stage_event(Stage::Fetching)).await.is_ok());
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(Topic::StageChanged).await;

        bus.publish(stage_event(Stage::Compressing)).await.unwrap();

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(received, QueryEvent::StageChanged { stage, .. } if stage == Stage::Compressing)
        );
    }

    #[tokio::test]
    async fn different_topics_no_crosstalk() {
        let bus = EventBus::new(8);
        let mut stage_rx = bus.subscribe(Topic::StageChanged).await;

        bus.publish(failed_event()).await.unwrap();

        let received = timeout(Duration::from_millis(100), stage_rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn subscribe_all_preserves_publish_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_all().await;

        bus.publish(stage_event(Stage::ResolvingTimeframe))
            .await
            .unwrap();
        bus.publish(stage_event(Stage::SelectingSource)).await.unwrap();
        bus.publish(failed_event()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            QueryEvent::StageChanged {
                stage: Stage::ResolvingTimeframe,
                ..
            }
        ));
        assert!(matches!(
            second,
            QueryEvent::StageChanged {
                stage: Stage::SelectingSource,
                ..
            }
        ));
        assert!(matches!(third, QueryEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn publisher_clone_works() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(Topic::Failed).await;
        let publisher = bus.publisher().clone();

        publisher.publish(failed_event()).await.unwrap();

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, QueryEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn saturated_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe(Topic::StageChanged).await;

        bus.publish(stage_event(Stage::Fetching)).await.unwrap();
        bus.publish(stage_event(Stage::Compressing)).await.unwrap();

        let first = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(first.is_ok());
        let second = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn topic_from_event_covers_all_variants() {
        assert_eq!(
            Topic::from_event(&stage_event(Stage::Done)),
            Topic::StageChanged
        );
        assert_eq!(Topic::from_event(&failed_event()), Topic::Failed);
        let completed = QueryEvent::Completed {
            trace_id: Uuid::new_v4(),
            session_id: "s1".into(),
            result: hivesift_schema::AnalysisResult::ordered(
                vec![],
                hivesift_schema::AnalysisSummary {
                    conversation_count: 0,
                    message_count: 0,
                    analyzed_at: chrono::Utc::now(),
                },
                hivesift_schema::AnalysisUsage {
                    elapsed: Duration::from_secs(0),
                    input_tokens: None,
                    output_tokens: None,
                    cost_usd: None,
                },
            ),
        };
        assert_eq!(Topic::from_event(&completed), Topic::Completed);
    }
}
