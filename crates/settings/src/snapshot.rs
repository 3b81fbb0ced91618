use serde::Deserialize;
use serde_json::{Map, Value};

/// One published version of the administrator-supplied settings.
///
/// Snapshots are never mutated after construction; a reload builds a new one
/// and swaps it in wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub version: i64,
    pub enabled: bool,
    pub bootstrap_config: Value,
    pub action_name: String,
    pub schema_prefix: String,
    pub skip_hits: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    Malformed(String),
    MissingField(&'static str),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Malformed(reason) => write!(f, "malformed settings document: {}", reason),
            SettingsError::MissingField(field) => write!(f, "undefined '{}'", field),
        }
    }
}

impl std::error::Error for SettingsError {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsDocument {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    bootstrap_properties: Option<Map<String, Value>>,
    #[serde(default)]
    search_action_name: Option<String>,
    #[serde(default)]
    schema_prefix: Option<String>,
    #[serde(default)]
    skip_hits: Option<bool>,
}

impl SettingsSnapshot {
    /// Parses and validates the raw payload from the settings store. Either
    /// every required field is present or nothing is produced.
    pub fn parse(payload: &str, version: i64) -> Result<Self, SettingsError> {
        let doc = serde_json::from_str::<SettingsDocument>(payload)
            .map_err(|err| SettingsError::Malformed(err.to_string()))?;

        let bootstrap_config = doc
            .bootstrap_properties
            .map(Value::Object)
            .ok_or(SettingsError::MissingField("bootstrapProperties"))?;
        let action_name = required_string(doc.search_action_name, "searchActionName")?;
        let schema_prefix = required_string(doc.schema_prefix, "schemaPrefix")?;

        Ok(Self {
            version,
            enabled: doc.enabled.unwrap_or(true),
            bootstrap_config,
            action_name,
            schema_prefix,
            skip_hits: doc.skip_hits.unwrap_or(false),
        })
    }

    /// Flat document view served by the admin read path. The version is an
    /// internal ordering detail and is not exposed.
    pub fn to_document_value(&self) -> Value {
        serde_json::json!({
            "enabled": self.enabled,
            "bootstrapProperties": self.bootstrap_config,
            "searchActionName": self.action_name,
            "schemaPrefix": self.schema_prefix,
            "skipHits": self.skip_hits,
        })
    }
}

fn required_string(value: Option<String>, field: &'static str) -> Result<String, SettingsError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(SettingsError::MissingField(field))
}
