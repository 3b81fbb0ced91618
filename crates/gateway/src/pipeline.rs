use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tbac_contracts::{AuthorizationExt, DecisionMetrics, SearchHit};
use tbac_policy::{AuthorizationRequest, Decision, PdpError, PolicyDecisionPoint};
use tbac_settings::SettingsSnapshot;
use tokio::time::Instant;
use tracing::Instrument;

use crate::metrics;

/// What happens to a hit when the PDP gives no decision for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecisionErrorPolicy {
    /// Fail open: the hit stays in the result.
    #[default]
    Keep,
    Drop,
}

/// Denominator of `average_decision_time`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecisionTimeAveraging {
    /// Every processed hit counts, including the ones that failed.
    #[default]
    AllHits,
    DecidedHits,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub on_decision_error: DecisionErrorPolicy,
    pub averaging: DecisionTimeAveraging,
    pub decision_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredResult {
    pub kept: Vec<SearchHit>,
    pub authorized_hits_count: usize,
    pub average_decision_time: f64,
    pub decision_errors: usize,
}

impl FilteredResult {
    pub fn metrics(&self) -> DecisionMetrics {
        DecisionMetrics {
            authorized_hits_count: self.authorized_hits_count,
            average_decision_time: self.average_decision_time,
        }
    }
}

/// Asks the PDP about each hit in turn and keeps the allowed ones.
#[derive(Clone)]
pub struct DecisionPipeline {
    pdp: Arc<dyn PolicyDecisionPoint>,
    options: PipelineOptions,
}

impl DecisionPipeline {
    pub fn new(pdp: Arc<dyn PolicyDecisionPoint>, options: PipelineOptions) -> Self {
        Self { pdp, options }
    }

    /// Hits are evaluated one after another; `kept` is a subsequence of
    /// `hits` in the original order.
    pub async fn run(
        &self,
        hits: Vec<SearchHit>,
        ext: &AuthorizationExt,
        snapshot: &SettingsSnapshot,
    ) -> FilteredResult {
        let processed = hits.len();
        let mut kept = Vec::with_capacity(processed);
        let mut decided = 0usize;
        let mut decision_errors = 0usize;
        let mut total = Duration::ZERO;

        for hit in hits {
            let resource = resource_attributes(&hit, &snapshot.schema_prefix);
            let request = AuthorizationRequest {
                tokens: &ext.tokens,
                action: &snapshot.action_name,
                resource: &resource,
                context: &ext.context,
            };

            let span = tracing::info_span!(
                "policy.evaluate",
                index = %hit.index,
                doc_id = %hit.id,
                action = %snapshot.action_name,
                latency_ms = tracing::field::Empty,
                outcome = tracing::field::Empty,
            );

            let (result, elapsed) = self.evaluate(&request).instrument(span).await;

            match result {
                Ok(decision) => {
                    decided += 1;
                    total += elapsed;
                    if decision.allowed {
                        kept.push(hit);
                    } else if let Some(reason) = decision.reason.as_deref() {
                        tracing::debug!(index = %hit.index, doc_id = %hit.id, reason, "hit denied");
                    }
                }
                Err(err) => {
                    decision_errors += 1;
                    tracing::error!(
                        index = %hit.index,
                        doc_id = %hit.id,
                        error = %err,
                        error_kind = err.kind(),
                        policy = ?self.options.on_decision_error,
                        "policy decision failed"
                    );
                    if self.options.on_decision_error == DecisionErrorPolicy::Keep {
                        kept.push(hit);
                    }
                }
            }
        }

        FilteredResult {
            authorized_hits_count: kept.len(),
            average_decision_time: average_decision_time(
                total,
                processed,
                decided,
                self.options.averaging,
            ),
            kept,
            decision_errors,
        }
    }

    async fn evaluate(
        &self,
        request: &AuthorizationRequest<'_>,
    ) -> (Result<Decision, PdpError>, Duration) {
        let started = Instant::now();
        let result = match self.options.decision_timeout {
            Some(limit) => tokio::time::timeout(limit, self.pdp.authorize(request))
                .await
                .unwrap_or(Err(PdpError::Timeout)),
            None => self.pdp.authorize(request).await,
        };
        let elapsed = started.elapsed();

        tracing::Span::current().record("latency_ms", elapsed.as_millis() as u64);
        let outcome = match &result {
            Ok(decision) if decision.allowed => "allow",
            Ok(_) => "deny",
            Err(_) => "error",
        };
        tracing::Span::current().record("outcome", outcome);
        metrics::observe_decision(outcome, result.is_ok().then_some(elapsed));
        if let Err(err) = &result {
            metrics::observe_decision_error(err.kind());
        }

        (result, elapsed)
    }
}

/// Working copy of the hit's source enriched with the entity attributes the
/// PDP expects. The hit itself is left untouched.
pub fn resource_attributes(hit: &SearchHit, schema_prefix: &str) -> Map<String, Value> {
    let mut resource = hit.source.clone().unwrap_or_default();
    resource.insert(
        "type".to_string(),
        Value::String(format!("{}::{}", schema_prefix, hit.index)),
    );
    resource.insert(
        "entity_type".to_string(),
        Value::String("resource".to_string()),
    );
    resource.insert("id".to_string(), Value::String(hit.id.clone()));
    resource
}

/// Milliseconds per hit. `-1.0` when there was nothing to evaluate.
pub fn average_decision_time(
    total: Duration,
    processed: usize,
    decided: usize,
    averaging: DecisionTimeAveraging,
) -> f64 {
    if processed == 0 {
        return DecisionMetrics::NO_HITS_AVERAGE;
    }

    let denominator = match averaging {
        DecisionTimeAveraging::AllHits => processed,
        DecisionTimeAveraging::DecidedHits => decided,
    };
    if denominator == 0 {
        return 0.0;
    }

    total.as_nanos() as f64 / 1_000_000.0 / denominator as f64
}
