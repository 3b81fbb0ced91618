//! Contract with the external policy decision point (PDP).
//!
//! The filter never evaluates policies itself. It hands the PDP a bootstrap
//! document whenever new settings are published and asks it one
//! `authorize(tokens, action, resource, context)` question per search hit.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy)]
pub struct AuthorizationRequest<'a> {
    pub tokens: &'a BTreeMap<String, String>,
    pub action: &'a str,
    pub resource: &'a Map<String, Value>,
    pub context: &'a Value,
}

impl AuthorizationRequest<'_> {
    pub fn to_input_value(&self) -> Value {
        serde_json::json!({
            "tokens": self.tokens,
            "action": self.action,
            "resource": self.resource,
            "context": self.context,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny() -> Self {
        Self {
            allowed: false,
            reason: None,
        }
    }
}

/// Why the PDP produced no decision for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdpError {
    Timeout,
    Unavailable(String),
    BadStatus(u16),
    InvalidResponse,
    /// The engine refused to evaluate the request, e.g. malformed tokens or
    /// resource attributes.
    Rejected(String),
}

impl std::fmt::Display for PdpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PdpError::Timeout => write!(f, "policy decision point timed out"),
            PdpError::Unavailable(reason) => {
                write!(f, "policy decision point unavailable: {}", reason)
            }
            PdpError::BadStatus(status) => {
                write!(f, "policy decision point returned status {}", status)
            }
            PdpError::InvalidResponse => {
                write!(f, "policy decision point returned an invalid response")
            }
            PdpError::Rejected(reason) => {
                write!(f, "policy decision point rejected the request: {}", reason)
            }
        }
    }
}

impl std::error::Error for PdpError {}

impl PdpError {
    pub fn kind(&self) -> &'static str {
        match self {
            PdpError::Timeout => "timeout",
            PdpError::Unavailable(_) => "unavailable",
            PdpError::BadStatus(_) => "bad_status",
            PdpError::InvalidResponse => "invalid_response",
            PdpError::Rejected(_) => "rejected",
        }
    }
}

#[async_trait]
pub trait PolicyDecisionPoint: Send + Sync {
    /// Loads (or reloads) the engine with the bootstrap document from the
    /// active settings.
    async fn init(&self, bootstrap_config: &Value) -> Result<(), PdpError>;

    async fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<Decision, PdpError>;

    async fn ready(&self) -> Result<(), PdpError> {
        Ok(())
    }
}
