use std::time::Duration;

use tbac_contracts::{EXT_KEY, SearchResponse};

use crate::pipeline::FilteredResult;

/// Builds the filtered response. Everything the host reported is carried over
/// except the hit list, `took` and the `ext.tbac` section.
pub fn assemble_response(
    original: SearchResponse,
    filtered: FilteredResult,
    skip_hits: bool,
    pipeline_elapsed: Duration,
) -> SearchResponse {
    let metrics = filtered.metrics();
    let hits = if skip_hits { Vec::new() } else { filtered.kept };
    let took = original
        .took
        .saturating_add(pipeline_elapsed.as_millis() as u64);

    original
        .with_hits(hits)
        .with_took(took)
        .with_ext_section(EXT_KEY, metrics.to_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original() -> SearchResponse {
        serde_json::from_value(serde_json::json!({
            "took": 12,
            "timed_out": false,
            "_shards": { "total": 1, "successful": 1, "skipped": 0, "failed": 0 },
            "hits": {
                "total": { "value": 3, "relation": "eq" },
                "max_score": 2.0,
                "hits": [
                    { "_index": "docs", "_id": "1", "_score": 2.0, "_source": {} },
                    { "_index": "docs", "_id": "2", "_score": 1.0, "_source": {} },
                    { "_index": "docs", "_id": "3", "_score": 0.5, "_source": {} }
                ]
            },
            "aggregations": { "owners": { "buckets": [{ "key": "a", "doc_count": 3 }] } },
            "ext": { "other": { "kept": true } }
        }))
        .expect("response should parse")
    }

    fn filtered(original: &SearchResponse) -> FilteredResult {
        let kept = vec![original.hits()[0].clone(), original.hits()[2].clone()];
        FilteredResult {
            authorized_hits_count: kept.len(),
            kept,
            average_decision_time: 4.5,
            decision_errors: 0,
        }
    }

    #[test]
    fn replaces_hits_adds_metrics_and_extends_took() {
        let original = original();
        let filtered = filtered(&original);
        let assembled = assemble_response(
            original.clone(),
            filtered,
            false,
            Duration::from_millis(8),
        );

        let ids: Vec<_> = assembled.hits().iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(assembled.took, 20);
        assert_eq!(assembled.rest, original.rest);
        assert_eq!(assembled.hits.rest, original.hits.rest);

        let ext = assembled.ext.expect("ext should exist");
        assert_eq!(ext.get("other"), Some(&serde_json::json!({ "kept": true })));
        assert_eq!(
            ext.get(EXT_KEY),
            Some(&serde_json::json!({
                "authorized_hits_count": 2,
                "average_decision_time": 4.5
            }))
        );
    }

    #[test]
    fn skip_hits_empties_list_but_reports_true_count() {
        let original = original();
        let filtered = filtered(&original);
        let assembled = assemble_response(original, filtered, true, Duration::ZERO);

        assert!(assembled.hits().is_empty());
        assert_eq!(assembled.took, 12);
        assert_eq!(
            assembled.hits.rest.get("total"),
            Some(&serde_json::json!({ "value": 3, "relation": "eq" }))
        );
        assert_eq!(
            assembled.ext.and_then(|ext| ext.get(EXT_KEY).cloned()),
            Some(serde_json::json!({
                "authorized_hits_count": 2,
                "average_decision_time": 4.5
            }))
        );
    }
}
