use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::pipeline::{DecisionErrorPolicy, DecisionTimeAveraging};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub settings_store: SettingsStoreKind,
    pub db_url: Option<String>,
    pub pdp_url: String,
    pub pdp_decision_path: String,
    pub pdp_bootstrap_path: String,
    pub pdp_timeout_ms: u64,
    pub settings_write_timeout_ms: u64,
    pub decision_error_policy: DecisionErrorPolicy,
    pub decision_time_averaging: DecisionTimeAveraging,
    pub admin_shared_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsStoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("TBAC_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("TBAC_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "TBAC_BIND_ADDR",
        )?;

        let admin_shared_secret = optional_nonempty(kv, "TBAC_ADMIN_SHARED_SECRET");

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("TBAC_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback() && admin_shared_secret.is_none() && !dev_allow_nonlocal_bind
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                message: "non-local bind requires TBAC_ADMIN_SHARED_SECRET; refuse startup"
                    .to_string(),
            });
        }

        let settings_store = parse_store_kind(kv.get("TBAC_SETTINGS_STORE"))?;
        let db_url = match settings_store {
            SettingsStoreKind::Postgres => Some(require_nonempty(kv, "TBAC_DB_URL")?),
            SettingsStoreKind::Memory => optional_nonempty(kv, "TBAC_DB_URL"),
        };

        let pdp_url = require_nonempty(kv, "TBAC_PDP_URL")?;
        if !(pdp_url.starts_with("http://") || pdp_url.starts_with("https://")) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TBAC_PDP_URL must be an http(s) URL".to_string(),
            });
        }

        let pdp_decision_path = parse_data_path(
            kv.get("TBAC_PDP_DECISION_PATH"),
            "tbac/authz/allow",
            "TBAC_PDP_DECISION_PATH",
        )?;
        let pdp_bootstrap_path = parse_data_path(
            kv.get("TBAC_PDP_BOOTSTRAP_PATH"),
            "tbac/bootstrap",
            "TBAC_PDP_BOOTSTRAP_PATH",
        )?;

        let pdp_timeout_ms = parse_u64(kv.get("TBAC_PDP_TIMEOUT_MS"), 500, "TBAC_PDP_TIMEOUT_MS")?;
        if pdp_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TBAC_PDP_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let settings_write_timeout_ms = parse_u64(
            kv.get("TBAC_SETTINGS_WRITE_TIMEOUT_MS"),
            1500,
            "TBAC_SETTINGS_WRITE_TIMEOUT_MS",
        )?;
        if settings_write_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TBAC_SETTINGS_WRITE_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let decision_error_policy = parse_error_policy(kv.get("TBAC_DECISION_ERROR_POLICY"))?;
        let decision_time_averaging = parse_averaging(kv.get("TBAC_DECISION_TIME_AVERAGING"))?;

        Ok(Self {
            bind_addr,
            settings_store,
            db_url,
            pdp_url,
            pdp_decision_path,
            pdp_bootstrap_path,
            pdp_timeout_ms,
            settings_write_timeout_ms,
            decision_error_policy,
            decision_time_averaging,
            admin_shared_secret,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_data_path(
    value: Option<&String>,
    default: &str,
    key: &'static str,
) -> Result<String, StartupError> {
    let path = value
        .map(|s| s.trim().trim_matches('/'))
        .filter(|s| !s.is_empty())
        .unwrap_or(default);

    let valid = path.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    });
    if !valid {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a slash-separated path of [A-Za-z0-9_-] segments", key),
        });
    }

    Ok(path.to_string())
}

fn parse_store_kind(value: Option<&String>) -> Result<SettingsStoreKind, StartupError> {
    let kind = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("memory");

    match kind {
        "memory" => Ok(SettingsStoreKind::Memory),
        "postgres" => Ok(SettingsStoreKind::Postgres),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "TBAC_SETTINGS_STORE must be memory or postgres".to_string(),
        }),
    }
}

fn parse_error_policy(value: Option<&String>) -> Result<DecisionErrorPolicy, StartupError> {
    let policy = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("keep");

    match policy {
        "keep" => Ok(DecisionErrorPolicy::Keep),
        "drop" => Ok(DecisionErrorPolicy::Drop),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "TBAC_DECISION_ERROR_POLICY must be keep or drop".to_string(),
        }),
    }
}

fn parse_averaging(value: Option<&String>) -> Result<DecisionTimeAveraging, StartupError> {
    let averaging = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("all-hits");

    match averaging {
        "all-hits" => Ok(DecisionTimeAveraging::AllHits),
        "decided-hits" => Ok(DecisionTimeAveraging::DecidedHits),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "TBAC_DECISION_TIME_AVERAGING must be all-hits or decided-hits".to_string(),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
