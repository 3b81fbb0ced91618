//! Search request and response values as seen by the filter.
//!
//! Only the fields the filter reads or rewrites are typed. Everything else
//! (shard counts, aggregations, suggestions, profiling, point-in-time ids,
//! cluster metadata, ...) is carried in a flattened `rest` map so it survives
//! a filter pass byte-for-byte at the JSON level.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EXT_KEY;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl SearchRequest {
    pub fn authorization_ext(&self) -> Option<&Value> {
        self.ext.as_ref().and_then(|ext| ext.get(EXT_KEY))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHits {
    #[serde(default)]
    pub hits: Vec<SearchHit>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub hits: SearchHits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl SearchResponse {
    pub fn hits(&self) -> &[SearchHit] {
        &self.hits.hits
    }

    /// Replaces the hit list, keeping `total`, `max_score` and every other
    /// field of the hits section.
    pub fn with_hits(mut self, hits: Vec<SearchHit>) -> Self {
        self.hits.hits = hits;
        self
    }

    pub fn with_took(mut self, took: u64) -> Self {
        self.took = took;
        self
    }

    pub fn with_ext_section(mut self, key: &str, section: Value) -> Self {
        self.ext
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), section);
        self
    }
}
