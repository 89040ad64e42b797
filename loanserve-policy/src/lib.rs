#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Posting-readiness engine: decides whether a waterfall-allocated payment
//! may auto-post, needs manual review, or must be blocked outright (spec
//! 4.2 risk scoring feeds this; spec 4.3/4.4 consume its decision).

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type TenantId = Uuid;
pub type ProposalId = String;

pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-tenant readiness thresholds. `risk_score_ceiling` and
/// `min_amount_cents` gate auto-posting directly; `manual_review_channels`
/// and `blocked_loans` are explicit allow/deny lists layered on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingReadinessRules {
    pub auto_post_enabled: bool,
    pub risk_score_ceiling: u8,
    pub min_amount_cents: i64,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub manual_review_channels: HashSet<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub blocked_loans: HashSet<String>,
}

impl Default for PostingReadinessRules {
    fn default() -> Self {
        Self {
            auto_post_enabled: true,
            risk_score_ceiling: 50,
            min_amount_cents: 0,
            manual_review_channels: HashSet::new(),
            blocked_loans: HashSet::new(),
        }
    }
}

impl PostingReadinessRules {
    pub fn evaluate(&self, request: &PostingReadinessRequest) -> EvaluationOutcome {
        let mut blocking = Vec::new();
        let mut review = Vec::new();

        if let Some(loan_id) = &request.loan_id {
            if self.blocked_loans.contains(loan_id) {
                blocking.push(ReadinessTrigger::LoanBlocked {
                    loan_id: loan_id.clone(),
                });
            }
        }

        if !self.auto_post_enabled {
            review.push(ReadinessTrigger::AutoPostDisabled);
        }

        if !request.loan_matched {
            review.push(ReadinessTrigger::LoanUnmatched);
        }

        if request.amount_cents < self.min_amount_cents {
            review.push(ReadinessTrigger::AmountBelowThreshold {
                threshold_cents: self.min_amount_cents,
                actual_cents: request.amount_cents,
            });
        }

        if request.risk_score > self.risk_score_ceiling {
            review.push(ReadinessTrigger::RiskScoreExceedsCeiling {
                ceiling: self.risk_score_ceiling,
                observed: request.risk_score,
            });
        }

        if self.manual_review_channels.contains(&request.channel) {
            review.push(ReadinessTrigger::ChannelRequiresManualReview {
                channel: request.channel.clone(),
            });
        }

        let decision = if !blocking.is_empty() {
            ReadinessDecision::Blocked
        } else if !review.is_empty() {
            ReadinessDecision::Pending
        } else {
            ReadinessDecision::Ready
        };

        let mut triggers = blocking;
        triggers.extend(review);

        EvaluationOutcome { decision, triggers }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRuleBinding {
    pub tenant_id: TenantId,
    pub rules: PostingReadinessRules,
}

#[async_trait]
pub trait PolicyRulePersistence: Send + Sync {
    async fn write_rule_set(&self, tenant_id: &TenantId, rules: &PostingReadinessRules) -> PolicyResult<()>;
    async fn read_rule_set(&self, tenant_id: &TenantId) -> PolicyResult<Option<PostingReadinessRules>>;
    async fn read_all(&self) -> PolicyResult<Vec<PolicyRuleBinding>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub decision: ReadinessDecision,
    pub triggers: Vec<ReadinessTrigger>,
}

/// `Ready` ⇒ auto-post with the real waterfall buckets. `Pending` ⇒
/// posting not ready; the poster writes ledger lines against suspense
/// only (spec 4.3). `Blocked` ⇒ hard reject, no ledger write at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessDecision {
    Ready,
    Pending,
    Blocked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessTrigger {
    LoanBlocked { loan_id: String },
    AutoPostDisabled,
    LoanUnmatched,
    AmountBelowThreshold { threshold_cents: i64, actual_cents: i64 },
    RiskScoreExceedsCeiling { ceiling: u8, observed: u8 },
    ChannelRequiresManualReview { channel: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessEvaluationEvent {
    pub tenant_id: TenantId,
    pub proposal_id: ProposalId,
    pub actor: String,
    pub decision: ReadinessDecision,
    pub triggers: Vec<ReadinessTrigger>,
    pub amount_cents: i64,
    pub channel: String,
    pub loan_id: Option<String>,
    pub risk_score: u8,
    pub risk_score_ceiling: u8,
    pub evaluated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PolicyEventSink: Send + Sync {
    async fn record(&self, event: ReadinessEvaluationEvent);
}

#[derive(Clone, Default)]
pub struct NoopPolicyEventSink;

#[async_trait]
impl PolicyEventSink for NoopPolicyEventSink {
    async fn record(&self, _event: ReadinessEvaluationEvent) {}
}

#[derive(Default)]
pub struct InMemoryPolicyEventSink {
    events: RwLock<Vec<ReadinessEvaluationEvent>>,
}

impl InMemoryPolicyEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ReadinessEvaluationEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl PolicyEventSink for InMemoryPolicyEventSink {
    async fn record(&self, event: ReadinessEvaluationEvent) {
        self.events.write().await.push(event);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostingReadinessRequest {
    pub id: ProposalId,
    pub tenant_id: TenantId,
    pub loan_id: Option<String>,
    pub amount_cents: i64,
    pub channel: String,
    pub risk_score: u8,
    pub loan_matched: bool,
    pub submitted_at: DateTime<Utc>,
}

impl PostingReadinessRequest {
    pub fn new(tenant_id: TenantId, amount_cents: i64, channel: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            loan_id: None,
            amount_cents,
            channel: channel.into(),
            risk_score: 0,
            loan_matched: true,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyContext {
    pub tenant_id: TenantId,
    pub actor: String,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn put_rule_set(&self, tenant_id: TenantId, rules: PostingReadinessRules) -> PolicyResult<()>;
    async fn get_rule_set(&self, tenant_id: &TenantId) -> PolicyResult<Option<PostingReadinessRules>>;
    async fn list_rule_sets(&self) -> PolicyResult<HashMap<TenantId, PostingReadinessRules>>;
}

#[derive(Default)]
pub struct InMemoryPolicyStore {
    rules: RwLock<HashMap<TenantId, PostingReadinessRules>>,
}

impl InMemoryPolicyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn put_rule_set(&self, tenant_id: TenantId, rules: PostingReadinessRules) -> PolicyResult<()> {
        self.rules.write().await.insert(tenant_id, rules);
        Ok(())
    }

    async fn get_rule_set(&self, tenant_id: &TenantId) -> PolicyResult<Option<PostingReadinessRules>> {
        Ok(self.rules.read().await.get(tenant_id).cloned())
    }

    async fn list_rule_sets(&self) -> PolicyResult<HashMap<TenantId, PostingReadinessRules>> {
        Ok(self.rules.read().await.clone())
    }
}

#[async_trait]
impl PolicyRulePersistence for InMemoryPolicyStore {
    async fn write_rule_set(&self, tenant_id: &TenantId, rules: &PostingReadinessRules) -> PolicyResult<()> {
        self.rules.write().await.insert(*tenant_id, rules.clone());
        Ok(())
    }

    async fn read_rule_set(&self, tenant_id: &TenantId) -> PolicyResult<Option<PostingReadinessRules>> {
        Ok(self.rules.read().await.get(tenant_id).cloned())
    }

    async fn read_all(&self) -> PolicyResult<Vec<PolicyRuleBinding>> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .map(|(tenant_id, rules)| PolicyRuleBinding {
                tenant_id: *tenant_id,
                rules: rules.clone(),
            })
            .collect())
    }
}

/// Cache-over-persistence wrapper: reads hit the in-memory cache first,
/// writes go through to the backing store before updating the cache.
#[derive(Clone)]
pub struct DurablePolicyStore<P>
where
    P: PolicyRulePersistence + 'static,
{
    persistence: Arc<P>,
    cache: Arc<InMemoryPolicyStore>,
}

impl<P> DurablePolicyStore<P>
where
    P: PolicyRulePersistence + 'static,
{
    #[must_use]
    pub fn new(persistence: Arc<P>) -> Self {
        Self {
            persistence,
            cache: Arc::new(InMemoryPolicyStore::new()),
        }
    }

    async fn load_into_cache(&self, binding: &PolicyRuleBinding) -> PolicyResult<()> {
        PolicyStore::put_rule_set(&*self.cache, binding.tenant_id, binding.rules.clone()).await
    }
}

#[async_trait]
impl<P> PolicyStore for DurablePolicyStore<P>
where
    P: PolicyRulePersistence + 'static,
{
    async fn put_rule_set(&self, tenant_id: TenantId, rules: PostingReadinessRules) -> PolicyResult<()> {
        self.persistence.write_rule_set(&tenant_id, &rules).await?;
        PolicyStore::put_rule_set(&*self.cache, tenant_id, rules).await
    }

    async fn get_rule_set(&self, tenant_id: &TenantId) -> PolicyResult<Option<PostingReadinessRules>> {
        if let Some(cached) = PolicyStore::get_rule_set(&*self.cache, tenant_id).await? {
            return Ok(Some(cached));
        }
        let fetched = self.persistence.read_rule_set(tenant_id).await?;
        if let Some(ref rules) = fetched {
            PolicyStore::put_rule_set(&*self.cache, *tenant_id, rules.clone()).await?;
        }
        Ok(fetched)
    }

    async fn list_rule_sets(&self) -> PolicyResult<HashMap<TenantId, PostingReadinessRules>> {
        let bindings = self.persistence.read_all().await?;
        for binding in &bindings {
            self.load_into_cache(binding).await?;
        }
        Ok(bindings.into_iter().map(|b| (b.tenant_id, b.rules)).collect())
    }
}

#[cfg(feature = "postgres-store")]
#[derive(Clone)]
pub struct PostgresPolicyStore {
    connection_string: String,
}

#[cfg(feature = "postgres-store")]
impl PostgresPolicyStore {
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[cfg(feature = "postgres-store")]
#[async_trait]
impl PolicyRulePersistence for PostgresPolicyStore {
    async fn write_rule_set(&self, tenant_id: &TenantId, rules: &PostingReadinessRules) -> PolicyResult<()> {
        let _ = (&self.connection_string, tenant_id, rules);
        Err(PolicyError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn read_rule_set(&self, tenant_id: &TenantId) -> PolicyResult<Option<PostingReadinessRules>> {
        let _ = (&self.connection_string, tenant_id);
        Err(PolicyError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn read_all(&self) -> PolicyResult<Vec<PolicyRuleBinding>> {
        let _ = &self.connection_string;
        Err(PolicyError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }
}

#[derive(Clone)]
pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
    default_rules: PostingReadinessRules,
    event_sink: Arc<dyn PolicyEventSink>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            default_rules: PostingReadinessRules::default(),
            event_sink: Arc::new(NoopPolicyEventSink),
        }
    }

    pub fn with_components(
        store: Arc<dyn PolicyStore>,
        default_rules: PostingReadinessRules,
        event_sink: Arc<dyn PolicyEventSink>,
    ) -> Self {
        Self {
            store,
            default_rules,
            event_sink,
        }
    }

    pub async fn evaluate(
        &self,
        context: PolicyContext,
        request: PostingReadinessRequest,
    ) -> PolicyResult<EvaluationOutcome> {
        if context.tenant_id != request.tenant_id {
            return Err(PolicyError::Validation(
                "request tenant does not match policy context".into(),
            ));
        }

        let rules = match self.store.get_rule_set(&request.tenant_id).await? {
            Some(rules) => rules,
            None => self.default_rules.clone(),
        };

        let outcome = rules.evaluate(&request);
        let event = ReadinessEvaluationEvent {
            tenant_id: request.tenant_id,
            proposal_id: request.id.clone(),
            actor: context.actor,
            decision: outcome.decision,
            triggers: outcome.triggers.clone(),
            amount_cents: request.amount_cents,
            channel: request.channel.clone(),
            loan_id: request.loan_id.clone(),
            risk_score: request.risk_score,
            risk_score_ceiling: rules.risk_score_ceiling,
            evaluated_at: Utc::now(),
        };
        self.event_sink.record(event).await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_rules() -> PostingReadinessRules {
        PostingReadinessRules {
            auto_post_enabled: true,
            risk_score_ceiling: 40,
            min_amount_cents: 1,
            manual_review_channels: HashSet::new(),
            blocked_loans: HashSet::new(),
        }
    }

    fn base_request(tenant_id: TenantId, amount_cents: i64) -> PostingReadinessRequest {
        let mut request = PostingReadinessRequest::new(tenant_id, amount_cents, "ach");
        request.loan_id = Some("17".into());
        request.loan_matched = true;
        request.risk_score = 10;
        request
    }

    #[tokio::test]
    async fn evaluate_auto_posts_when_clean() {
        let tenant = Uuid::new_v4();
        let store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        store.put_rule_set(tenant, make_rules()).await.unwrap();
        let engine = PolicyEngine::new(store);

        let outcome = engine
            .evaluate(
                PolicyContext {
                    tenant_id: tenant,
                    actor: "servicing-worker".into(),
                },
                base_request(tenant, 150_000),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            EvaluationOutcome {
                decision: ReadinessDecision::Ready,
                triggers: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn unmatched_loan_requires_review() {
        let tenant = Uuid::new_v4();
        let store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        store.put_rule_set(tenant, make_rules()).await.unwrap();
        let engine = PolicyEngine::new(store);

        let mut request = base_request(tenant, 500_000);
        request.loan_id = None;
        request.loan_matched = false;
        request.risk_score = 20;

        let outcome = engine
            .evaluate(
                PolicyContext {
                    tenant_id: tenant,
                    actor: "servicing-worker".into(),
                },
                request,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ReadinessDecision::Pending);
        assert!(outcome.triggers.contains(&ReadinessTrigger::LoanUnmatched));
    }

    #[tokio::test]
    async fn high_risk_score_requires_review() {
        let tenant = Uuid::new_v4();
        let store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        store.put_rule_set(tenant, make_rules()).await.unwrap();
        let engine = PolicyEngine::new(store);

        let mut request = base_request(tenant, 150_000);
        request.risk_score = 85;

        let outcome = engine
            .evaluate(
                PolicyContext {
                    tenant_id: tenant,
                    actor: "servicing-worker".into(),
                },
                request,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, ReadinessDecision::Pending);
        assert!(matches!(
            outcome.triggers[0],
            ReadinessTrigger::RiskScoreExceedsCeiling { ceiling: 40, observed: 85 }
        ));
    }

    #[tokio::test]
    async fn blocked_loan_rejects_regardless_of_other_triggers() {
        let tenant = Uuid::new_v4();
        let store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        let mut rules = make_rules();
        rules.blocked_loans.insert("99".into());
        store.put_rule_set(tenant, rules).await.unwrap();
        let engine = PolicyEngine::new(store);

        let mut request = base_request(tenant, 150_000);
        request.loan_id = Some("99".into());

        let outcome = engine
            .evaluate(
                PolicyContext {
                    tenant_id: tenant,
                    actor: "servicing-worker".into(),
                },
                request,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            EvaluationOutcome {
                decision: ReadinessDecision::Blocked,
                triggers: vec![ReadinessTrigger::LoanBlocked { loan_id: "99".into() }],
            }
        );
    }

    #[tokio::test]
    async fn evaluate_rejects_tenant_mismatch() {
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();
        let store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        let engine = PolicyEngine::new(store);

        let err = engine
            .evaluate(
                PolicyContext {
                    tenant_id: tenant,
                    actor: "servicing-worker".into(),
                },
                base_request(other, 1_000),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Validation(_)));
    }

    #[tokio::test]
    async fn emits_evaluation_event() {
        let tenant = Uuid::new_v4();
        let store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        store.put_rule_set(tenant, make_rules()).await.unwrap();
        let sink = Arc::new(InMemoryPolicyEventSink::new());
        let event_sink: Arc<dyn PolicyEventSink> = sink.clone();
        let engine = PolicyEngine::with_components(store, PostingReadinessRules::default(), event_sink);

        engine
            .evaluate(
                PolicyContext {
                    tenant_id: tenant,
                    actor: "servicing-worker".into(),
                },
                base_request(tenant, 75_000),
            )
            .await
            .unwrap();

        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, ReadinessDecision::Ready);
        assert_eq!(events[0].amount_cents, 75_000);
    }

    #[tokio::test]
    async fn durable_store_populates_cache_from_persistence() {
        let tenant = Uuid::new_v4();
        let persistence = Arc::new(InMemoryPolicyStore::new());
        let rules = make_rules();
        PolicyStore::put_rule_set(&*persistence, tenant, rules.clone())
            .await
            .unwrap();

        let store: Arc<dyn PolicyStore> = Arc::new(DurablePolicyStore::new(persistence));
        let fetched = store.get_rule_set(&tenant).await.unwrap().unwrap();
        assert_eq!(fetched, rules);

        let listed = store.list_rule_sets().await.unwrap();
        assert_eq!(listed.get(&tenant), Some(&rules));
    }

    #[test]
    fn matrix_covers_each_trigger_independently() {
        struct Sample {
            rules: PostingReadinessRules,
            amount: i64,
            risk_score: u8,
            loan_matched: bool,
            expected_decision: ReadinessDecision,
        }

        let samples = vec![
            Sample {
                rules: make_rules(),
                amount: 50_000,
                risk_score: 10,
                loan_matched: true,
                expected_decision: ReadinessDecision::Ready,
            },
            Sample {
                rules: make_rules(),
                amount: 50_000,
                risk_score: 90,
                loan_matched: true,
                expected_decision: ReadinessDecision::Pending,
            },
            Sample {
                rules: make_rules(),
                amount: 50_000,
                risk_score: 10,
                loan_matched: false,
                expected_decision: ReadinessDecision::Pending,
            },
            Sample {
                rules: PostingReadinessRules {
                    auto_post_enabled: false,
                    ..make_rules()
                },
                amount: 50_000,
                risk_score: 10,
                loan_matched: true,
                expected_decision: ReadinessDecision::Pending,
            },
        ];

        for sample in samples {
            let mut request = base_request(Uuid::new_v4(), sample.amount);
            request.risk_score = sample.risk_score;
            request.loan_matched = sample.loan_matched;
            let outcome = sample.rules.evaluate(&request);
            assert_eq!(outcome.decision, sample.expected_decision);
        }
    }
}
