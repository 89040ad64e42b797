//! Consumer framework (spec 4.7): per-message ack/nack/DLQ classification,
//! processed-message dedup, and retry-with-backoff before DLQ handoff.
//! Grounded on the wider pack's `consumer_tasks.rs` pattern (tracing span
//! per message carrying correlation/tenant ids, retry wrapper ahead of a
//! dead-letter handoff), expressed through `async_trait` + `thiserror`
//! rather than that source's raw `Box<dyn Error>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ConsumerResult<T> = Result<T, ConsumerError>;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("poison message: {0}")]
    Poison(String),
    #[error("retryable failure: {0}")]
    Retryable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Correlation context carried through the span for every delivery,
/// mirroring `extract_correlation_fields` from the pack's AR consumer.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: Uuid,
    pub tenant_id: Uuid,
    pub correlation_id: String,
    pub source_module: String,
}

/// Outcome of one delivery attempt (spec 4.7's three-way classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RetryableFailure,
    Poison,
}

/// Dedup seam: `(message_id, tenant_id)` unique constraint from spec 3.1
/// ("Processed-message marker"), written inside the consumer's own
/// transaction so the check-then-mark is atomic with the business write.
#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    async fn is_processed(&self, message_id: Uuid, tenant_id: Uuid) -> ConsumerResult<bool>;
    async fn mark_processed(&self, message_id: Uuid, tenant_id: Uuid) -> ConsumerResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryProcessedMessageStore {
    seen: tokio::sync::RwLock<std::collections::HashSet<(Uuid, Uuid)>>,
}

impl InMemoryProcessedMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ProcessedMessageStore for InMemoryProcessedMessageStore {
    async fn is_processed(&self, message_id: Uuid, tenant_id: Uuid) -> ConsumerResult<bool> {
        Ok(self.seen.read().await.contains(&(message_id, tenant_id)))
    }

    async fn mark_processed(&self, message_id: Uuid, tenant_id: Uuid) -> ConsumerResult<()> {
        self.seen.write().await.insert((message_id, tenant_id));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// What happens to a delivery once its outcome is known, expressed as data
/// so callers (the real AMQP channel, or a test harness) don't need to
/// reimplement the classification rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryDisposition {
    Ack,
    NackRequeue,
    NackToDlq { reason: String },
}

/// Runs `process` with exponential backoff up to `config.max_attempts`,
/// classifying the final outcome. Business logic returning
/// `ConsumerError::Poison` short-circuits immediately without consuming a
/// retry, matching spec 4.7's "never retry a poison message in place".
#[tracing::instrument(skip(process, config), fields(message_id = %ctx.message_id, tenant_id = %ctx.tenant_id, correlation_id = %ctx.correlation_id, source_module = %ctx.source_module))]
pub async fn retry_with_backoff<F, Fut>(
    ctx: &MessageContext,
    process: F,
    config: &RetryConfig,
) -> (Outcome, DeliveryDisposition)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ConsumerResult<()>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match process().await {
            Ok(()) => {
                tracing::info!(attempt, "message processed");
                return (Outcome::Success, DeliveryDisposition::Ack);
            }
            Err(ConsumerError::Poison(reason)) => {
                tracing::warn!(attempt, reason = %reason, "poison message, routing to dlq");
                return (
                    Outcome::Poison,
                    DeliveryDisposition::NackToDlq { reason },
                );
            }
            Err(err) if attempt >= config.max_attempts => {
                tracing::error!(attempt, error = %err, "retries exhausted, routing to dlq");
                return (
                    Outcome::RetryableFailure,
                    DeliveryDisposition::NackToDlq {
                        reason: err.to_string(),
                    },
                );
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "retryable failure, backing off");
                tokio::time::sleep(config.base_delay * attempt).await;
            }
        }
    }
}

/// Wraps `process` with the dedup check from spec 4.7's "processed_messages"
/// contract: an already-seen `(message_id, tenant_id)` acks without running
/// the handler again.
pub async fn process_once<F, Fut>(
    store: &dyn ProcessedMessageStore,
    ctx: &MessageContext,
    config: &RetryConfig,
    process: F,
) -> ConsumerResult<DeliveryDisposition>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ConsumerResult<()>>,
{
    if store.is_processed(ctx.message_id, ctx.tenant_id).await? {
        tracing::debug!(message_id = %ctx.message_id, "duplicate delivery, acking without reprocessing");
        return Ok(DeliveryDisposition::Ack);
    }

    let (outcome, disposition) = retry_with_backoff(ctx, process, config).await;
    if outcome == Outcome::Success {
        store.mark_processed(ctx.message_id, ctx.tenant_id).await?;
    }
    Ok(disposition)
}

/// Long-running subscribe loop shape: one task per queue, shut down by a
/// shared `CancellationToken` (spec 5's per-consumer goroutine-equivalent).
/// A real binding pulls deliveries off a `lapin::Consumer`; this trait lets
/// tests drive the loop with a canned delivery source instead.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    async fn next(&self) -> Option<(MessageContext, Vec<u8>)>;
}

pub async fn run_consumer<F, Fut>(
    source: Arc<dyn DeliverySource>,
    store: Arc<dyn ProcessedMessageStore>,
    config: RetryConfig,
    shutdown: CancellationToken,
    handle: F,
) where
    F: Fn(MessageContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ConsumerResult<()>> + Send,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("consumer shutting down");
                return;
            }
            delivery = source.next() => {
                let Some((ctx, payload)) = delivery else {
                    tracing::info!("delivery source closed, consumer exiting");
                    return;
                };
                let handle = &handle;
                let _ = process_once(store.as_ref(), &ctx, &config, || handle(ctx.clone(), payload.clone())).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    fn ctx() -> MessageContext {
        MessageContext {
            message_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            correlation_id: "corr-1".into(),
            source_module: "payments".into(),
        }
    }

    #[tokio::test]
    async fn success_acks_without_retry() {
        let calls = AtomicU32::new(0);
        let (outcome, disposition) = retry_with_backoff(
            &ctx(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            &RetryConfig::default(),
        )
        .await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(disposition, DeliveryDisposition::Ack);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poison_skips_retries_entirely() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig { max_attempts: 5, base_delay: Duration::from_millis(1) };
        let (outcome, disposition) = retry_with_backoff(
            &ctx(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ConsumerError::Poison("bad schema".into())) }
            },
            &config,
        )
        .await;
        assert_eq!(outcome, Outcome::Poison);
        assert!(matches!(disposition, DeliveryDisposition::NackToDlq { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failure_exhausts_then_routes_to_dlq() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig { max_attempts: 3, base_delay: Duration::from_millis(1) };
        let (outcome, disposition) = retry_with_backoff(
            &ctx(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ConsumerError::Retryable("db deadlock".into())) }
            },
            &config,
        )
        .await;
        assert_eq!(outcome, Outcome::RetryableFailure);
        assert!(matches!(disposition, DeliveryDisposition::NackToDlq { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_delivery_acks_without_reprocessing() {
        let store = InMemoryProcessedMessageStore::shared();
        let message_ctx = ctx();
        store
            .mark_processed(message_ctx.message_id, message_ctx.tenant_id)
            .await
            .expect("mark processed");

        let calls = AtomicU32::new(0);
        let disposition = process_once(store.as_ref(), &message_ctx, &RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .expect("process_once");

        assert_eq!(disposition, DeliveryDisposition::Ack);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "handler must not rerun for a seen message");
    }

    #[tokio::test]
    async fn first_delivery_marks_processed_on_success() {
        let store = InMemoryProcessedMessageStore::shared();
        let message_ctx = ctx();
        process_once(store.as_ref(), &message_ctx, &RetryConfig::default(), || async { Ok(()) })
            .await
            .expect("process_once");

        assert!(store
            .is_processed(message_ctx.message_id, message_ctx.tenant_id)
            .await
            .expect("is_processed"));
    }
}
