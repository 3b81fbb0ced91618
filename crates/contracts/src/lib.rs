use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod search;

pub use search::{SearchHit, SearchHits, SearchRequest, SearchResponse};

pub const PLUGIN_NAME: &str = "tbac";

/// Key of the extension block on both the request and the response side.
pub const EXT_KEY: &str = PLUGIN_NAME;

pub const SETTINGS_KEY: &str = "plugins.tbac.settings";
pub const LAST_UPDATED_KEY: &str = "plugins.tbac.updatedAt";

pub const ADMIN_SETTINGS_PATH: &str = "/_plugins/tbac/settings";

/// Caller identity and evaluation context carried in `ext.tbac` of a search
/// request.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationExt {
    pub tokens: BTreeMap<String, String>,
    pub context: Value,
    /// Token kinds whose value was not a string and therefore dropped.
    pub skipped_tokens: Vec<String>,
}

impl AuthorizationExt {
    pub fn from_value(value: &Value) -> Self {
        let mut tokens = BTreeMap::new();
        let mut skipped_tokens = Vec::new();

        if let Some(raw_tokens) = value.get("tokens").and_then(|v| v.as_object()) {
            for (kind, token) in raw_tokens {
                match token.as_str() {
                    Some(token) => {
                        tokens.insert(kind.clone(), token.to_string());
                    }
                    None => skipped_tokens.push(kind.clone()),
                }
            }
        }

        let context = match value.get("context") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(context) => context.clone(),
        };

        Self {
            tokens,
            context,
            skipped_tokens,
        }
    }
}

/// Decision telemetry appended to a filtered response under `ext.tbac`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetrics {
    pub authorized_hits_count: usize,
    pub average_decision_time: f64,
}

impl DecisionMetrics {
    pub const NO_HITS_AVERAGE: f64 = -1.0;

    pub fn to_value(self) -> Value {
        serde_json::json!({
            "authorized_hits_count": self.authorized_hits_count,
            "average_decision_time": self.average_decision_time,
        })
    }
}
