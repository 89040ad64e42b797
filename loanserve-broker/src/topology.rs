//! Broker topology as data (spec 4.1): exchanges, queues, bindings, the
//! quorum+max-priority refusal rule, and the precondition-mismatch
//! migration path (delete+recreate when empty, version when not).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

pub type TopologyResult<T> = Result<T, TopologyError>;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
}

#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Quorum,
    Classic,
    Lazy,
}

#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub queue_type: QueueType,
    pub delivery_limit: Option<u32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub max_length: Option<u64>,
    pub ttl: Option<Duration>,
    pub max_priority: Option<u8>,
}

impl QueueSpec {
    fn violates_quorum_priority(&self) -> bool {
        self.queue_type == QueueType::Quorum && self.max_priority.is_some()
    }

    fn matches_live(&self, live: &LiveQueueInfo) -> bool {
        self.queue_type == live.queue_type && self.max_priority == live.max_priority
    }
}

#[derive(Debug, Clone)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct BrokerTopology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

fn dlq(family: &str) -> QueueSpec {
    QueueSpec {
        name: format!("dlq.{family}"),
        queue_type: QueueType::Quorum,
        delivery_limit: None,
        dead_letter_exchange: None,
        dead_letter_routing_key: None,
        max_length: None,
        ttl: None,
        max_priority: None,
    }
}

fn bounded(name: &str, dlx: &str, routing_key: &str) -> QueueSpec {
    QueueSpec {
        name: name.to_string(),
        queue_type: QueueType::Quorum,
        delivery_limit: Some(6),
        dead_letter_exchange: Some(dlx.to_string()),
        dead_letter_routing_key: Some(routing_key.to_string()),
        max_length: None,
        ttl: None,
        max_priority: None,
    }
}

/// The representative surface from spec 4.1: exchanges, payment/investor/
/// escrow/remittance/notification/audit queues, and DLQs per family.
/// Configurable in production (operators may declare a superset); this is
/// the canonical baseline the manager ships with.
#[must_use]
pub fn default_topology() -> BrokerTopology {
    let exchanges = vec![
        ExchangeSpec { name: "payments.topic".into(), kind: ExchangeKind::Topic },
        ExchangeSpec { name: "payments.dlq".into(), kind: ExchangeKind::Direct },
        ExchangeSpec { name: "documents.direct".into(), kind: ExchangeKind::Direct },
        ExchangeSpec { name: "dlx.main".into(), kind: ExchangeKind::Topic },
        ExchangeSpec { name: "audit.topic".into(), kind: ExchangeKind::Topic },
        ExchangeSpec { name: "notifications.topic".into(), kind: ExchangeKind::Topic },
        ExchangeSpec { name: "servicing.direct".into(), kind: ExchangeKind::Direct },
        ExchangeSpec { name: "settlement.topic".into(), kind: ExchangeKind::Topic },
        ExchangeSpec { name: "reconciliation.topic".into(), kind: ExchangeKind::Topic },
    ];

    let mut queues = vec![
        bounded("payments.intake", "dlx.main", "payments.intake"),
        bounded("payments.processing", "dlx.main", "payments.processing"),
        bounded("payments.reversal", "dlx.main", "payments.reversal"),
        bounded("payments.returned", "dlx.main", "payments.returned"),
        bounded("investor.calculations", "dlx.main", "investor.calculations"),
        bounded("investor.clawback", "dlx.main", "investor.clawback"),
        bounded("q.forecast", "dlx.main", "q.forecast"),
        bounded("q.schedule.disbursement", "dlx.main", "q.schedule.disbursement"),
        bounded("q.escrow.analysis", "dlx.main", "q.escrow.analysis"),
        bounded("q.remit.aggregate", "dlx.main", "q.remit.aggregate"),
        bounded("q.remit.export", "dlx.main", "q.remit.export"),
        bounded("q.remit.settle", "dlx.main", "q.remit.settle"),
        bounded("q.remit.events.audit", "dlx.main", "q.remit.events.audit"),
        bounded("notifications.email", "dlx.main", "notifications.email"),
        bounded("notifications.dashboard", "dlx.main", "notifications.dashboard"),
    ];
    queues.push(QueueSpec {
        name: "q.escrow.dlq".into(),
        queue_type: QueueType::Quorum,
        delivery_limit: None,
        dead_letter_exchange: None,
        dead_letter_routing_key: None,
        max_length: None,
        ttl: None,
        max_priority: None,
    });
    queues.push(QueueSpec {
        name: "audit.events".into(),
        queue_type: QueueType::Lazy,
        delivery_limit: None,
        dead_letter_exchange: None,
        dead_letter_routing_key: None,
        max_length: None,
        ttl: None,
        max_priority: None,
    });
    for family in ["payments", "notifications"] {
        queues.push(dlq(family));
    }

    let bindings = vec![
        BindingSpec { exchange: "payments.topic".into(), queue: "payments.intake".into(), routing_key: "payment.received".into() },
        BindingSpec { exchange: "payments.topic".into(), queue: "payments.processing".into(), routing_key: "payment.posted".into() },
        BindingSpec { exchange: "payments.topic".into(), queue: "payments.reversal".into(), routing_key: "payment.reversed".into() },
        BindingSpec { exchange: "payments.topic".into(), queue: "payments.returned".into(), routing_key: "payment.returned".into() },
        BindingSpec { exchange: "audit.topic".into(), queue: "audit.events".into(), routing_key: "audit.event_appended".into() },
        BindingSpec { exchange: "notifications.topic".into(), queue: "notifications.email".into(), routing_key: "#".into() },
        BindingSpec { exchange: "notifications.topic".into(), queue: "notifications.dashboard".into(), routing_key: "#".into() },
    ];

    BrokerTopology { exchanges, queues, bindings }
}

fn validate_static(topology: &BrokerTopology) -> TopologyResult<()> {
    for queue in &topology.queues {
        if queue.violates_quorum_priority() {
            return Err(TopologyError::Validation(format!(
                "queue {} is quorum type and declares max-priority; quorum queues must not carry max-priority",
                queue.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveQueueInfo {
    pub queue_type: QueueType,
    pub max_priority: Option<u8>,
    pub message_count: u64,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveExchangeInfo {
    pub kind: ExchangeKind,
}

/// Seam over the broker's management HTTP API (spec 6: `GET /queues/{vhost}`,
/// `/exchanges/{vhost}`), injected so the validator can be unit-tested
/// without a live broker.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn fetch_queue(&self, name: &str) -> TopologyResult<Option<LiveQueueInfo>>;
    async fn fetch_exchange(&self, name: &str) -> TopologyResult<Option<LiveExchangeInfo>>;
}

#[derive(Debug, Clone, Copy)]
pub enum MigrationAction {
    Declared,
    RecreatedEmpty,
    Versioned,
}

#[derive(Debug, Clone)]
pub struct QueueOutcome {
    pub queue: String,
    pub action: MigrationAction,
    pub resolved_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeclareReport {
    pub declared_exchanges: usize,
    pub queue_outcomes: Vec<QueueOutcome>,
    pub bindings_applied: usize,
}

impl DeclareReport {
    #[must_use]
    pub fn migrations(&self) -> Vec<&QueueOutcome> {
        self.queue_outcomes
            .iter()
            .filter(|o| !matches!(o.action, MigrationAction::Declared))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    MissingQueue(String),
    MissingExchange(String),
    WrongQueueType { queue: String, expected: QueueType, actual: QueueType },
    WrongExchangeType { exchange: String, expected: ExchangeKind, actual: ExchangeKind },
    QuorumPriorityConflict(String),
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub mismatches: Vec<Mismatch>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[async_trait]
pub trait TopologyManager: Send + Sync {
    async fn declare(&self, topology: &BrokerTopology) -> TopologyResult<DeclareReport>;
}

/// No-declaration read-only check against live state (spec 4.1 "validator
/// mode"). Works against any `ManagementClient`, real or in-memory.
pub async fn validate(
    client: &dyn ManagementClient,
    topology: &BrokerTopology,
) -> TopologyResult<ValidationReport> {
    validate_static(topology)?;
    let mut mismatches = Vec::new();

    for exchange in &topology.exchanges {
        match client.fetch_exchange(&exchange.name).await? {
            None => mismatches.push(Mismatch::MissingExchange(exchange.name.clone())),
            Some(live) if live.kind != exchange.kind => {
                mismatches.push(Mismatch::WrongExchangeType {
                    exchange: exchange.name.clone(),
                    expected: exchange.kind,
                    actual: live.kind,
                });
            }
            Some(_) => {}
        }
    }

    for queue in &topology.queues {
        if queue.violates_quorum_priority() {
            mismatches.push(Mismatch::QuorumPriorityConflict(queue.name.clone()));
            continue;
        }
        match client.fetch_queue(&queue.name).await? {
            None => mismatches.push(Mismatch::MissingQueue(queue.name.clone())),
            Some(live) if !queue.matches_live(&live) => {
                mismatches.push(Mismatch::WrongQueueType {
                    queue: queue.name.clone(),
                    expected: queue.queue_type,
                    actual: live.queue_type,
                });
            }
            Some(_) => {}
        }
    }

    Ok(ValidationReport { mismatches })
}

#[derive(Debug, Default)]
struct TopologyState {
    queues: HashMap<String, LiveQueueInfo>,
    exchanges: HashMap<String, LiveExchangeInfo>,
    bindings: Vec<BindingSpec>,
}

/// In-process double standing in for a real broker connection, in the
/// teacher's service-trait-plus-double style (`LedgerService` /
/// `InMemoryLedgerService`).
#[derive(Debug, Default)]
pub struct InMemoryTopologyManager {
    state: RwLock<TopologyState>,
}

impl InMemoryTopologyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a pre-existing live queue, used by tests to exercise the
    /// migration path (precondition mismatch on redeclare).
    pub async fn seed_live_queue(&self, name: &str, info: LiveQueueInfo) {
        self.state.write().await.queues.insert(name.to_string(), info);
    }
}

#[async_trait]
impl ManagementClient for InMemoryTopologyManager {
    async fn fetch_queue(&self, name: &str) -> TopologyResult<Option<LiveQueueInfo>> {
        Ok(self.state.read().await.queues.get(name).copied())
    }

    async fn fetch_exchange(&self, name: &str) -> TopologyResult<Option<LiveExchangeInfo>> {
        Ok(self.state.read().await.exchanges.get(name).copied())
    }
}

#[async_trait]
impl TopologyManager for InMemoryTopologyManager {
    async fn declare(&self, topology: &BrokerTopology) -> TopologyResult<DeclareReport> {
        validate_static(topology)?;
        let mut state = self.state.write().await;
        let mut report = DeclareReport::default();

        for exchange in &topology.exchanges {
            state.exchanges.insert(
                exchange.name.clone(),
                LiveExchangeInfo { kind: exchange.kind },
            );
            report.declared_exchanges += 1;
        }

        for queue in &topology.queues {
            let canonical = LiveQueueInfo {
                queue_type: queue.queue_type,
                max_priority: queue.max_priority,
                message_count: 0,
                consumer_count: 0,
            };

            let outcome = match state.queues.get(&queue.name).copied() {
                None => {
                    state.queues.insert(queue.name.clone(), canonical);
                    QueueOutcome {
                        queue: queue.name.clone(),
                        action: MigrationAction::Declared,
                        resolved_name: queue.name.clone(),
                    }
                }
                Some(live) if queue.matches_live(&live) => QueueOutcome {
                    queue: queue.name.clone(),
                    action: MigrationAction::Declared,
                    resolved_name: queue.name.clone(),
                },
                Some(live) if live.message_count == 0 && live.consumer_count == 0 => {
                    state.queues.insert(queue.name.clone(), canonical);
                    QueueOutcome {
                        queue: queue.name.clone(),
                        action: MigrationAction::RecreatedEmpty,
                        resolved_name: queue.name.clone(),
                    }
                }
                Some(_) => {
                    let versioned = format!("{}.v2", queue.name);
                    state.queues.insert(versioned.clone(), canonical);
                    QueueOutcome {
                        queue: queue.name.clone(),
                        action: MigrationAction::Versioned,
                        resolved_name: versioned,
                    }
                }
            };
            report.queue_outcomes.push(outcome);
        }

        for binding in &topology.bindings {
            let resolved_queue = report
                .queue_outcomes
                .iter()
                .find(|o| o.queue == binding.queue)
                .map(|o| o.resolved_name.clone())
                .unwrap_or_else(|| binding.queue.clone());
            state.bindings.push(BindingSpec {
                exchange: binding.exchange.clone(),
                queue: resolved_queue,
                routing_key: binding.routing_key.clone(),
            });
            report.bindings_applied += 1;
        }

        Ok(report)
    }
}

/// Real AMQP 0-9-1 backend. Declarations run on a dedicated channel that is
/// closed on any precondition failure (spec 5: "topology declarations use
/// isolated channels... closed on precondition failure") so a bad redeclare
/// never poisons the connection the rest of the process shares.
#[cfg(feature = "lapin-store")]
pub struct LapinTopologyManager {
    connection: lapin::Connection,
}

#[cfg(feature = "lapin-store")]
impl LapinTopologyManager {
    #[must_use]
    pub fn new(connection: lapin::Connection) -> Self {
        Self { connection }
    }

    fn queue_type_arg(queue_type: QueueType) -> &'static str {
        match queue_type {
            QueueType::Quorum => "quorum",
            QueueType::Classic => "classic",
            QueueType::Lazy => "classic",
        }
    }

    fn queue_table(queue: &QueueSpec) -> lapin::types::FieldTable {
        use lapin::types::AMQPValue;
        use lapin::types::FieldTable;
        use lapin::types::LongString;

        let mut table = FieldTable::default();
        table.insert(
            "x-queue-type".into(),
            AMQPValue::LongString(LongString::from(Self::queue_type_arg(queue.queue_type))),
        );
        if queue.queue_type == QueueType::Lazy {
            table.insert(
                "x-queue-mode".into(),
                AMQPValue::LongString(LongString::from("lazy")),
            );
        }
        if let Some(limit) = queue.delivery_limit {
            table.insert("x-delivery-limit".into(), AMQPValue::LongLongInt(i64::from(limit)));
        }
        if let Some(dlx) = &queue.dead_letter_exchange {
            table.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        if let Some(key) = &queue.dead_letter_routing_key {
            table.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }
        if let Some(len) = queue.max_length {
            table.insert("x-max-length".into(), AMQPValue::LongLongInt(len as i64));
        }
        if let Some(ttl) = queue.ttl {
            table.insert("x-expires".into(), AMQPValue::LongLongInt(ttl.as_millis() as i64));
        }
        if let Some(priority) = queue.max_priority {
            table.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(priority));
        }
        table
    }
}

#[cfg(feature = "lapin-store")]
#[async_trait]
impl TopologyManager for LapinTopologyManager {
    async fn declare(&self, topology: &BrokerTopology) -> TopologyResult<DeclareReport> {
        use lapin::ExchangeKind as LapinExchangeKind;
        use lapin::options::ExchangeDeclareOptions;
        use lapin::options::QueueBindOptions;
        use lapin::options::QueueDeclareOptions;
        use lapin::types::FieldTable;

        validate_static(topology)?;
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TopologyError::Transient(e.to_string()))?;
        let mut report = DeclareReport::default();

        for exchange in &topology.exchanges {
            let kind = match exchange.kind {
                ExchangeKind::Topic => LapinExchangeKind::Topic,
                ExchangeKind::Direct => LapinExchangeKind::Direct,
            };
            channel
                .exchange_declare(
                    &exchange.name,
                    kind,
                    ExchangeDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TopologyError::Conflict(e.to_string()))?;
            report.declared_exchanges += 1;
        }

        for queue in &topology.queues {
            let resolved_name = queue.name.clone();
            match channel
                .queue_declare(
                    &resolved_name,
                    QueueDeclareOptions { durable: true, ..Default::default() },
                    Self::queue_table(queue),
                )
                .await
            {
                Ok(_) => report.queue_outcomes.push(QueueOutcome {
                    queue: queue.name.clone(),
                    action: MigrationAction::Declared,
                    resolved_name,
                }),
                Err(_) => {
                    // Precondition mismatch: the channel lapin gave us is now
                    // closed by the broker, so migration continues on a fresh one.
                    let fresh = self
                        .connection
                        .create_channel()
                        .await
                        .map_err(|e| TopologyError::Transient(e.to_string()))?;
                    let versioned = format!("{}.v2", queue.name);
                    fresh
                        .queue_declare(
                            &versioned,
                            QueueDeclareOptions { durable: true, ..Default::default() },
                            Self::queue_table(queue),
                        )
                        .await
                        .map_err(|e| TopologyError::Conflict(e.to_string()))?;
                    report.queue_outcomes.push(QueueOutcome {
                        queue: queue.name.clone(),
                        action: MigrationAction::Versioned,
                        resolved_name: versioned,
                    });
                }
            }
        }

        for binding in &topology.bindings {
            let resolved_queue = report
                .queue_outcomes
                .iter()
                .find(|o| o.queue == binding.queue)
                .map(|o| o.resolved_name.as_str())
                .unwrap_or(&binding.queue);
            channel
                .queue_bind(
                    resolved_queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TopologyError::Conflict(e.to_string()))?;
            report.bindings_applied += 1;
        }

        Ok(report)
    }
}

/// Real management-HTTP backend (spec 6: `GET /queues/{vhost}`,
/// `/exchanges/{vhost}`), used by the `validate-topology` CLI subcommand.
/// 10s timeout per spec 5.
#[cfg(feature = "management-http")]
pub struct HttpManagementClient {
    client: reqwest::Client,
    base_url: String,
    vhost: String,
}

#[cfg(feature = "management-http")]
impl HttpManagementClient {
    pub fn new(base_url: impl Into<String>, vhost: impl Into<String>) -> TopologyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TopologyError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            vhost: vhost.into(),
        })
    }
}

#[cfg(feature = "management-http")]
#[derive(serde::Deserialize)]
struct RawQueue {
    #[serde(rename = "type")]
    queue_type: Option<String>,
    arguments: std::collections::HashMap<String, serde_json::Value>,
    messages: Option<u64>,
    consumers: Option<u32>,
}

#[cfg(feature = "management-http")]
#[derive(serde::Deserialize)]
struct RawExchange {
    #[serde(rename = "type")]
    kind: String,
}

#[cfg(feature = "management-http")]
#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn fetch_queue(&self, name: &str) -> TopologyResult<Option<LiveQueueInfo>> {
        let url = format!(
            "{}/api/queues/{}/{}",
            self.base_url,
            urlencoding_vhost(&self.vhost),
            name
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TopologyError::Transient(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: RawQueue = response
            .error_for_status()
            .map_err(|e| TopologyError::Transient(e.to_string()))?
            .json()
            .await
            .map_err(|e| TopologyError::Internal(e.to_string()))?;

        let queue_type = match raw.queue_type.as_deref() {
            Some("quorum") => QueueType::Quorum,
            _ if raw.arguments.get("x-queue-mode").and_then(|v| v.as_str()) == Some("lazy") => {
                QueueType::Lazy
            }
            _ => QueueType::Classic,
        };
        let max_priority = raw
            .arguments
            .get("x-max-priority")
            .and_then(serde_json::Value::as_u64)
            .map(|v| v as u8);

        Ok(Some(LiveQueueInfo {
            queue_type,
            max_priority,
            message_count: raw.messages.unwrap_or(0),
            consumer_count: raw.consumers.unwrap_or(0),
        }))
    }

    async fn fetch_exchange(&self, name: &str) -> TopologyResult<Option<LiveExchangeInfo>> {
        let url = format!(
            "{}/api/exchanges/{}/{}",
            self.base_url,
            urlencoding_vhost(&self.vhost),
            name
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TopologyError::Transient(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: RawExchange = response
            .error_for_status()
            .map_err(|e| TopologyError::Transient(e.to_string()))?
            .json()
            .await
            .map_err(|e| TopologyError::Internal(e.to_string()))?;

        let kind = match raw.kind.as_str() {
            "direct" => ExchangeKind::Direct,
            _ => ExchangeKind::Topic,
        };
        Ok(Some(LiveExchangeInfo { kind }))
    }
}

#[cfg(feature = "management-http")]
fn urlencoding_vhost(vhost: &str) -> String {
    if vhost == "/" { "%2f".to_string() } else { vhost.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_topology_has_no_quorum_priority_conflicts() {
        let topology = default_topology();
        assert!(validate_static(&topology).is_ok());
    }

    #[test]
    fn quorum_queue_with_max_priority_is_rejected() {
        let mut topology = BrokerTopology::default();
        topology.queues.push(QueueSpec {
            name: "bad".into(),
            queue_type: QueueType::Quorum,
            delivery_limit: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            max_length: None,
            ttl: None,
            max_priority: Some(5),
        });
        let err = validate_static(&topology).unwrap_err();
        assert!(matches!(err, TopologyError::Validation(_)));
    }

    #[tokio::test]
    async fn declare_is_idempotent_on_fresh_topology() {
        let manager = InMemoryTopologyManager::new();
        let topology = default_topology();
        let report = manager.declare(&topology).await.expect("declare");
        assert_eq!(report.declared_exchanges, topology.exchanges.len());
        assert!(report.migrations().is_empty());

        let second = manager.declare(&topology).await.expect("redeclare");
        assert!(second.migrations().is_empty(), "redeclaring unchanged topology is a no-op");
    }

    #[tokio::test]
    async fn empty_mismatched_queue_is_recreated_in_place() {
        let manager = InMemoryTopologyManager::new();
        manager
            .seed_live_queue(
                "payments.intake",
                LiveQueueInfo {
                    queue_type: QueueType::Classic,
                    max_priority: None,
                    message_count: 0,
                    consumer_count: 0,
                },
            )
            .await;

        let report = manager.declare(&default_topology()).await.expect("declare");
        let outcome = report
            .queue_outcomes
            .iter()
            .find(|o| o.queue == "payments.intake")
            .expect("outcome present");
        assert!(matches!(outcome.action, MigrationAction::RecreatedEmpty));
        assert_eq!(outcome.resolved_name, "payments.intake");
    }

    #[tokio::test]
    async fn non_empty_mismatched_queue_gets_versioned() {
        let manager = InMemoryTopologyManager::new();
        manager
            .seed_live_queue(
                "payments.intake",
                LiveQueueInfo {
                    queue_type: QueueType::Classic,
                    max_priority: None,
                    message_count: 42,
                    consumer_count: 1,
                },
            )
            .await;

        let report = manager.declare(&default_topology()).await.expect("declare");
        let outcome = report
            .queue_outcomes
            .iter()
            .find(|o| o.queue == "payments.intake")
            .expect("outcome present");
        assert!(matches!(outcome.action, MigrationAction::Versioned));
        assert_eq!(outcome.resolved_name, "payments.intake.v2");
    }

    #[tokio::test]
    async fn validator_reports_missing_queues_and_exchanges() {
        let manager = InMemoryTopologyManager::new();
        let report = validate(&manager, &default_topology()).await.expect("validate");
        assert!(!report.is_clean());
        assert!(report
            .mismatches
            .iter()
            .any(|m| matches!(m, Mismatch::MissingExchange(_))));
        assert!(report
            .mismatches
            .iter()
            .any(|m| matches!(m, Mismatch::MissingQueue(_))));
    }

    #[tokio::test]
    async fn validator_is_clean_after_declare() {
        let manager = InMemoryTopologyManager::new();
        let topology = default_topology();
        manager.declare(&topology).await.expect("declare");
        let report = validate(&manager, &topology).await.expect("validate");
        assert!(report.is_clean());
    }
}
