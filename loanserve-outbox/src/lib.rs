#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Transactional outbox: durable "intent to publish" rows written in the
//! same transaction as the business change they announce (spec 4.4/4.5),
//! plus the background dispatcher that delivers them to the broker with
//! at-least-once semantics.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type TenantId = Uuid;
pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// A row not yet written to the store. `aggregate_type`/`event_type` drive
/// the exchange/routing-key mapping below; `payload` is the opaque JSON
/// body the dispatcher serializes verbatim.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Persistence seam for outbox rows. In production this insert happens
/// inside the poster's database transaction (spec 4.4 step 4); the
/// dispatcher only ever reads/updates rows that are already committed.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, message: NewOutboxMessage) -> OutboxResult<OutboxMessage>;

    /// Ordered by created_at ASC, WHERE published_at IS NULL, LIMIT limit.
    async fn poll_unpublished(&self, limit: usize) -> OutboxResult<Vec<OutboxMessage>>;

    async fn mark_published(&self, id: Uuid) -> OutboxResult<()>;

    async fn record_failure(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    async fn get(&self, id: Uuid) -> OutboxResult<OutboxMessage>;
}

/// Routes an outbox event_type onto the declared exchange topology
/// (spec 4.1/4.5). Unknown event types fall back to the general topic
/// exchange with the event_type as routing key, matching the dispatcher's
/// "never lose the row" contract rather than rejecting it outright.
#[must_use]
pub fn route_for_event_type(event_type: &str) -> (&'static str, String) {
    match event_type {
        "payment.posted" | "payment.settled" | "payment.returned" | "payment.reversed"
        | "payment.failed" => ("payments.topic", event_type.to_string()),
        "servicing.run_started" | "servicing.run_completed" | "servicing.exception_opened" => {
            ("servicing.direct", event_type.to_string())
        }
        "reconciliation.variance_recorded" => ("reconciliation.topic", event_type.to_string()),
        "audit.event_appended" => ("audit.topic", event_type.to_string()),
        other => ("notifications.topic", other.to_string()),
    }
}

/// Publishes a serialized payload to the broker with confirms. Implemented
/// by `loanserve-broker`'s channel wrapper in production; tests inject a
/// recording double.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> OutboxResult<()>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub published: usize,
    pub failed: usize,
    pub parked: usize,
}

/// Poll/publish/confirm/backoff loop over an `OutboxStore`.
pub struct OutboxDispatcher<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: DispatcherConfig,
}

impl<S, P> OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: BrokerPublisher,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// One polling cycle: drains up to `batch_size` unpublished rows in
    /// created_at order and processes each strictly in order, matching the
    /// within-cycle ordering guarantee in spec 4.5/5.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> OutboxResult<DispatchOutcome> {
        let rows = self.store.poll_unpublished(self.config.batch_size).await?;
        let mut outcome = DispatchOutcome::default();

        for row in rows {
            let (exchange, routing_key) = route_for_event_type(&row.event_type);
            let payload = serde_json::to_vec(&row.payload)
                .map_err(|e| OutboxError::Internal(format!("payload serialization: {e}")))?;

            match self.publisher.publish(exchange, &routing_key, &payload).await {
                Ok(()) => {
                    self.store.mark_published(row.id).await?;
                    outcome.published += 1;
                    tracing::debug!(outbox_id = %row.id, exchange, routing_key, "published outbox row");
                }
                Err(err) => {
                    self.store.record_failure(row.id, &err.to_string()).await?;
                    let updated = self.store.get(row.id).await?;
                    if updated.attempt_count >= self.config.max_attempts {
                        outcome.parked += 1;
                        tracing::error!(
                            outbox_id = %row.id,
                            attempts = updated.attempt_count,
                            "outbox row parked after exceeding max attempts"
                        );
                    } else {
                        outcome.failed += 1;
                        tracing::warn!(outbox_id = %row.id, error = %err, "outbox publish failed, will retry");
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Runs `run_once` on `config.poll_interval` until `shutdown` is
    /// cancelled. Backoff between individual row retries is implicit in
    /// the poll interval: a failed row simply reappears on the next cycle.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("outbox dispatcher shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        tracing::error!(error = %err, "outbox dispatch cycle failed");
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<VecDeque<OutboxMessage>>,
}

impl InMemoryOutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, message: NewOutboxMessage) -> OutboxResult<OutboxMessage> {
        if message.aggregate_type.trim().is_empty() {
            return Err(OutboxError::Validation(
                "aggregate_type must not be empty".into(),
            ));
        }
        let row = OutboxMessage {
            id: Uuid::new_v4(),
            tenant_id: message.tenant_id,
            aggregate_type: message.aggregate_type,
            aggregate_id: message.aggregate_id,
            event_type: message.event_type,
            payload: message.payload,
            created_at: Utc::now(),
            published_at: None,
            attempt_count: 0,
            last_error: None,
        };
        self.rows.lock().await.push_back(row.clone());
        Ok(row)
    }

    async fn poll_unpublished(&self, limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        let rows = self.rows.lock().await;
        let mut unpublished: Vec<OutboxMessage> = rows
            .iter()
            .filter(|r| r.published_at.is_none())
            .cloned()
            .collect();
        unpublished.sort_by_key(|r| r.created_at);
        unpublished.truncate(limit);
        Ok(unpublished)
    }

    async fn mark_published(&self, id: Uuid) -> OutboxResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| OutboxError::Storage(format!("outbox row {id} not found")))?;
        if row.published_at.is_none() {
            row.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| OutboxError::Storage(format!("outbox row {id} not found")))?;
        row.attempt_count += 1;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> OutboxResult<OutboxMessage> {
        self.rows
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| OutboxError::Storage(format!("outbox row {id} not found")))
    }
}

#[cfg(feature = "lapin-store")]
pub struct LapinBrokerPublisher {
    channel: lapin::Channel,
}

#[cfg(feature = "lapin-store")]
#[async_trait]
impl BrokerPublisher for LapinBrokerPublisher {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> OutboxResult<()> {
        use lapin::BasicProperties;
        use lapin::options::BasicPublishOptions;

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

        if confirm.is_nack() {
            return Err(OutboxError::Transient("publish was nacked".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct AlwaysFailsPublisher;

    #[async_trait]
    impl BrokerPublisher for AlwaysFailsPublisher {
        async fn publish(&self, _: &str, _: &str, _: &[u8]) -> OutboxResult<()> {
            Err(OutboxError::Transient("broker unreachable".into()))
        }
    }

    struct AlwaysOkPublisher;

    #[async_trait]
    impl BrokerPublisher for AlwaysOkPublisher {
        async fn publish(&self, _: &str, _: &str, _: &[u8]) -> OutboxResult<()> {
            Ok(())
        }
    }

    fn sample_message(tenant_id: TenantId) -> NewOutboxMessage {
        NewOutboxMessage {
            tenant_id,
            aggregate_type: "payments".into(),
            aggregate_id: "pay-1".into(),
            event_type: "payment.posted".into(),
            payload: serde_json::json!({"payment_id": "pay-1"}),
        }
    }

    #[test]
    fn routes_payment_posted_to_payments_topic() {
        let (exchange, key) = route_for_event_type("payment.posted");
        assert_eq!(exchange, "payments.topic");
        assert_eq!(key, "payment.posted");
    }

    #[test]
    fn routes_unknown_event_type_to_notifications() {
        let (exchange, key) = route_for_event_type("something.custom");
        assert_eq!(exchange, "notifications.topic");
        assert_eq!(key, "something.custom");
    }

    #[tokio::test]
    async fn dispatcher_marks_published_on_success() {
        let store = InMemoryOutboxStore::shared();
        store.insert(sample_message(Uuid::new_v4())).await.unwrap();
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            Arc::new(AlwaysOkPublisher),
            DispatcherConfig::default(),
        );

        let outcome = dispatcher.run_once().await.unwrap();
        assert_eq!(outcome.published, 1);
        assert_eq!(outcome.failed, 0);

        let remaining = store.poll_unpublished(10).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn dispatcher_retries_and_eventually_parks() {
        let store = InMemoryOutboxStore::shared();
        store.insert(sample_message(Uuid::new_v4())).await.unwrap();
        let config = DispatcherConfig {
            poll_interval: Duration::from_millis(1),
            batch_size: 10,
            max_attempts: 2,
        };
        let dispatcher = OutboxDispatcher::new(store.clone(), Arc::new(AlwaysFailsPublisher), config);

        let first = dispatcher.run_once().await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.parked, 0);

        let second = dispatcher.run_once().await.unwrap();
        assert_eq!(second.parked, 1);

        let remaining = store.poll_unpublished(10).await.unwrap();
        assert_eq!(remaining.len(), 1, "parked rows stay visible as unpublished");
        assert_eq!(remaining[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn poll_unpublished_orders_by_created_at() {
        let store = InMemoryOutboxStore::new();
        let tenant = Uuid::new_v4();
        store.insert(sample_message(tenant)).await.unwrap();
        store.insert(sample_message(tenant)).await.unwrap();
        let rows = store.poll_unpublished(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].created_at <= rows[1].created_at);
    }

    #[tokio::test]
    async fn insert_rejects_blank_aggregate_type() {
        let store = InMemoryOutboxStore::new();
        let mut message = sample_message(Uuid::new_v4());
        message.aggregate_type = "  ".into();
        let err = store.insert(message).await.unwrap_err();
        assert!(matches!(err, OutboxError::Validation(_)));
    }
}
