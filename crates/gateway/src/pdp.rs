use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tbac_policy::{AuthorizationRequest, Decision, PdpError, PolicyDecisionPoint};

#[derive(Debug, Clone)]
pub struct HttpPdpConfig {
    pub base_url: String,
    pub decision_path: String,
    pub bootstrap_path: String,
    pub timeout: Duration,
}

/// PDP reached over an OPA-compatible data API.
#[derive(Clone)]
pub struct HttpPdp {
    base_url: String,
    decision_path: String,
    bootstrap_path: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct DataResponse<T> {
    result: Option<T>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DecisionResult {
    Bare(bool),
    Object {
        allow: bool,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl From<DecisionResult> for Decision {
    fn from(value: DecisionResult) -> Self {
        match value {
            DecisionResult::Bare(allowed) => Decision {
                allowed,
                reason: None,
            },
            DecisionResult::Object { allow, reason } => Decision {
                allowed: allow,
                reason,
            },
        }
    }
}

fn transport_error(err: reqwest::Error) -> PdpError {
    if err.is_timeout() {
        PdpError::Timeout
    } else {
        PdpError::Unavailable(err.to_string())
    }
}

impl HttpPdp {
    pub fn new(config: HttpPdpConfig) -> Result<Self, PdpError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(transport_error)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            decision_path: config.decision_path,
            bootstrap_path: config.bootstrap_path,
            http,
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/v1/data/{}", self.base_url, path)
    }
}

#[async_trait]
impl PolicyDecisionPoint for HttpPdp {
    async fn init(&self, bootstrap_config: &serde_json::Value) -> Result<(), PdpError> {
        let resp = self
            .http
            .put(self.data_url(&self.bootstrap_path))
            .json(bootstrap_config)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(PdpError::BadStatus(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<Decision, PdpError> {
        let resp = self
            .http
            .post(self.data_url(&self.decision_path))
            .json(&serde_json::json!({ "input": request.to_input_value() }))
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(PdpError::BadStatus(resp.status().as_u16()));
        }

        let decoded = resp
            .json::<DataResponse<DecisionResult>>()
            .await
            .map_err(|_| PdpError::InvalidResponse)?;

        // An undefined rule leaves `result` out entirely; that is not a decision.
        decoded
            .result
            .map(Decision::from)
            .ok_or(PdpError::InvalidResponse)
    }

    async fn ready(&self) -> Result<(), PdpError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(PdpError::BadStatus(resp.status().as_u16()));
        }
        Ok(())
    }
}
