use std::sync::Arc;

use tbac_contracts::{AuthorizationExt, SearchRequest, SearchResponse};
use tbac_settings::VersionedSettingsCache;
use tokio::time::Instant;

use crate::assemble::assemble_response;
use crate::metrics;
use crate::pipeline::DecisionPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Filtered,
    /// No valid settings were ever loaded.
    NoSettings,
    Disabled,
    NoAuthorizationExt,
}

impl FilterOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOutcome::Filtered => "filtered",
            FilterOutcome::NoSettings => "no_settings",
            FilterOutcome::Disabled => "disabled",
            FilterOutcome::NoAuthorizationExt => "no_authorization_ext",
        }
    }
}

/// Response-phase hook: decides whether a search response is filtered and
/// runs the pipeline when it is.
#[derive(Clone)]
pub struct SearchFilter {
    cache: Arc<VersionedSettingsCache>,
    pipeline: DecisionPipeline,
}

impl SearchFilter {
    pub fn new(cache: Arc<VersionedSettingsCache>, pipeline: DecisionPipeline) -> Self {
        Self { cache, pipeline }
    }

    pub fn cache(&self) -> &Arc<VersionedSettingsCache> {
        &self.cache
    }

    pub async fn process(
        &self,
        request: &SearchRequest,
        mut response: SearchResponse,
    ) -> (SearchResponse, FilterOutcome) {
        let started = Instant::now();

        let Some(snapshot) = self.cache.current().await else {
            tracing::warn!("authorization settings not loaded; passing search response through");
            return pass_through(response, FilterOutcome::NoSettings);
        };

        if !snapshot.enabled {
            return pass_through(response, FilterOutcome::Disabled);
        }

        let Some(raw_ext) = request.authorization_ext() else {
            tracing::warn!("search request carries no authorization extension; passing through");
            return pass_through(response, FilterOutcome::NoAuthorizationExt);
        };

        let ext = AuthorizationExt::from_value(raw_ext);
        for kind in &ext.skipped_tokens {
            tracing::warn!(token_kind = %kind, "ignoring non-string token");
        }

        let hits = std::mem::take(&mut response.hits.hits);
        tracing::Span::current().record("hits", hits.len() as u64);

        let filtered = self.pipeline.run(hits, &ext, &snapshot).await;
        tracing::Span::current().record("authorized", filtered.authorized_hits_count as u64);
        if filtered.decision_errors > 0 {
            tracing::warn!(
                decision_errors = filtered.decision_errors,
                "some hits were evaluated without a decision"
            );
        }

        let assembled = assemble_response(response, filtered, snapshot.skip_hits, started.elapsed());
        metrics::observe_filter_outcome(FilterOutcome::Filtered.as_str());
        (assembled, FilterOutcome::Filtered)
    }
}

fn pass_through(
    response: SearchResponse,
    outcome: FilterOutcome,
) -> (SearchResponse, FilterOutcome) {
    metrics::observe_filter_outcome(outcome.as_str());
    (response, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;
    use tbac_policy::{AuthorizationRequest, Decision, PdpError, PolicyDecisionPoint};
    use tbac_settings::{MemorySettingsStore, SettingsStore};

    use crate::pipeline::PipelineOptions;

    /// Allows every document whose id does not start with `secret`.
    struct PrefixPdp;

    #[async_trait]
    impl PolicyDecisionPoint for PrefixPdp {
        async fn init(&self, _bootstrap_config: &Value) -> Result<(), PdpError> {
            Ok(())
        }

        async fn authorize(
            &self,
            request: &AuthorizationRequest<'_>,
        ) -> Result<Decision, PdpError> {
            tokio::time::sleep(Duration::from_millis(4)).await;
            let id = request
                .resource
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if id.starts_with("secret") {
                Ok(Decision::deny())
            } else {
                Ok(Decision::allow())
            }
        }
    }

    async fn filter_with(settings: Option<Value>) -> SearchFilter {
        let store = Arc::new(MemorySettingsStore::new());
        if let Some(settings) = settings {
            store
                .write(&settings.to_string(), 1_700_000_000_000)
                .await
                .expect("write should succeed");
        }
        let pdp: Arc<dyn PolicyDecisionPoint> = Arc::new(PrefixPdp);
        let cache = Arc::new(VersionedSettingsCache::new(store, pdp.clone()));
        SearchFilter::new(cache, DecisionPipeline::new(pdp, PipelineOptions::default()))
    }

    fn settings(enabled: bool, skip_hits: bool) -> Value {
        serde_json::json!({
            "enabled": enabled,
            "bootstrapProperties": { "CEDARLING_APPLICATION_NAME": "search" },
            "searchActionName": "Jans::Action::\"Search\"",
            "schemaPrefix": "Jans",
            "skipHits": skip_hits
        })
    }

    fn request(with_ext: bool) -> SearchRequest {
        let mut body = serde_json::json!({ "query": { "match_all": {} } });
        if with_ext {
            body["ext"] = serde_json::json!({
                "tbac": {
                    "tokens": { "access_token": "at", "id_token": 7 },
                    "context": {}
                }
            });
        }
        serde_json::from_value(body).expect("request should parse")
    }

    fn response() -> SearchResponse {
        serde_json::from_value(serde_json::json!({
            "took": 5,
            "timed_out": false,
            "hits": {
                "total": { "value": 3, "relation": "eq" },
                "max_score": 1.0,
                "hits": [
                    { "_index": "docs", "_id": "open-1", "_source": {} },
                    { "_index": "docs", "_id": "secret-2", "_source": {} },
                    { "_index": "docs", "_id": "open-3", "_source": {} }
                ]
            }
        }))
        .expect("response should parse")
    }

    #[tokio::test(start_paused = true)]
    async fn filters_hits_and_extends_took_by_pipeline_time() {
        let filter = filter_with(Some(settings(true, false))).await;
        let (out, outcome) = filter.process(&request(true), response()).await;

        assert_eq!(outcome, FilterOutcome::Filtered);
        let ids: Vec<_> = out.hits().iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["open-1", "open-3"]);
        assert_eq!(out.took, 5 + 12);
        assert_eq!(
            out.ext.and_then(|ext| ext.get("tbac").cloned()),
            Some(serde_json::json!({
                "authorized_hits_count": 2,
                "average_decision_time": 4.0
            }))
        );
    }

    #[tokio::test]
    async fn passes_through_without_settings() {
        let filter = filter_with(None).await;
        let (out, outcome) = filter.process(&request(true), response()).await;

        assert_eq!(outcome, FilterOutcome::NoSettings);
        assert_eq!(out, response());
    }

    #[tokio::test]
    async fn passes_through_when_disabled() {
        let filter = filter_with(Some(settings(false, false))).await;
        let (out, outcome) = filter.process(&request(true), response()).await;

        assert_eq!(outcome, FilterOutcome::Disabled);
        assert_eq!(out, response());
    }

    #[tokio::test]
    async fn passes_through_without_authorization_ext() {
        let filter = filter_with(Some(settings(true, false))).await;
        let (out, outcome) = filter.process(&request(false), response()).await;

        assert_eq!(outcome, FilterOutcome::NoAuthorizationExt);
        assert_eq!(out, response());
    }

    #[tokio::test(start_paused = true)]
    async fn skip_hits_returns_metrics_only() {
        let filter = filter_with(Some(settings(true, true))).await;
        let (out, outcome) = filter.process(&request(true), response()).await;

        assert_eq!(outcome, FilterOutcome::Filtered);
        assert!(out.hits().is_empty());
        assert_eq!(
            out.hits.rest.get("total"),
            Some(&serde_json::json!({ "value": 3, "relation": "eq" }))
        );
        assert_eq!(
            out.ext
                .as_ref()
                .and_then(|ext| ext.get("tbac"))
                .and_then(|m| m.get("authorized_hits_count")),
            Some(&serde_json::json!(2))
        );
    }
}
