//! Configuration data structures for the load balancer.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files and
//! include defaults so that minimal configs remain concise. Durations are
//! written as humantime strings (`"5s"`, `"250ms"`) or bare whole seconds and
//! only converted when a record is turned into core types through
//! [`HandlerConfig::to_definition`].
use std::time::Duration;

use hyper::header::HeaderName;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    config::validation::{ValidationError, ValidationResult},
    core::{
        handler::{HandlerDefinition, HandlerSettings},
        stats::StatsBackend,
        strategy::IP_HASH,
        target::{DEFAULT_HEALTH_TIMEOUT, TargetSpec},
    },
};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_strategy() -> String {
    crate::core::strategy::ROUND_ROBIN.to_string()
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Emit one `lb_proxy::access` event per dispatched request
    #[serde(default)]
    pub access_log: bool,
    #[serde(default)]
    pub stats: StatsBackend,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Handler served when no route matches
    #[serde(default)]
    pub default_handler: Option<String>,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            access_log: false,
            stats: StatsBackend::default(),
            health_check: HealthCheckConfig::default(),
            default_handler: None,
            handlers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Convert every handler record, stopping at the first invalid one.
    /// Hosts without their own timeout use `health_check.timeout_secs`.
    pub fn definitions(&self) -> ValidationResult<Vec<HandlerDefinition>> {
        let timeout = self.health_check.timeout();
        self.handlers
            .iter()
            .map(|handler| handler.definition_with(timeout))
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Probe timeout for hosts that do not set their own
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            timeout_secs: 5,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One backend inside a handler.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub target: String,
    #[serde(default)]
    pub health: Option<String>,
    /// Health probe timeout, e.g. "3s" or 3
    #[serde(default, deserialize_with = "seconds_or_duration")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub down: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub id: Option<String>,
}

impl HostConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            health: None,
            timeout: None,
            down: false,
            weight: default_weight(),
            id: None,
        }
    }

    fn to_spec(&self, handler: &str, default_timeout: Duration) -> ValidationResult<TargetSpec> {
        let timeout = parse_duration(
            self.timeout.as_deref(),
            &format!("handler '{handler}' host '{}' timeout", self.target),
        )?
        .unwrap_or(default_timeout);

        Ok(TargetSpec {
            id: self.id.clone(),
            url: self.target.clone(),
            health: self.health.clone().filter(|h| !h.is_empty()),
            timeout,
            weight: self.weight,
            down: self.down,
        })
    }
}

/// A named pool of hosts plus its routes and transport settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub key: String,
    /// Pin clients to a host by IP; overrides `strategy`
    #[serde(default)]
    pub ip_hash: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub middleware: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub raw_proxy: bool,
    #[serde(default)]
    pub client_ip_header: Option<String>,
    #[serde(default)]
    pub max_conn: usize,
    #[serde(default)]
    pub shutdown_wait: Option<String>,
    #[serde(default)]
    pub dial_timeout: Option<String>,
    #[serde(default)]
    pub response_header_timeout: Option<String>,
    #[serde(default)]
    pub keep_alive_timeout: Option<String>,
    #[serde(default)]
    pub disable_keep_alives: bool,
    #[serde(default)]
    pub disable_compression: bool,
}

impl HandlerConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ip_hash: false,
            strategy: default_strategy(),
            routes: Vec::new(),
            middleware: Vec::new(),
            hosts: Vec::new(),
            raw_proxy: false,
            client_ip_header: None,
            max_conn: 0,
            shutdown_wait: None,
            dial_timeout: None,
            response_header_timeout: None,
            keep_alive_timeout: None,
            disable_keep_alives: false,
            disable_compression: false,
        }
    }

    /// Strategy actually used by the handler.
    pub fn effective_strategy(&self) -> &str {
        if self.ip_hash { IP_HASH } else { &self.strategy }
    }

    pub fn to_settings(&self) -> ValidationResult<HandlerSettings> {
        let field = |name: &str| format!("handler '{}' {name}", self.key);

        let client_ip_header = match self.client_ip_header.as_deref() {
            None | Some("") => None,
            Some(name) => Some(HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ValidationError::InvalidField {
                    field: field("client_ip_header"),
                    message: e.to_string(),
                }
            })?),
        };

        Ok(HandlerSettings {
            dial_timeout: parse_duration(self.dial_timeout.as_deref(), &field("dial_timeout"))?,
            response_header_timeout: parse_duration(
                self.response_header_timeout.as_deref(),
                &field("response_header_timeout"),
            )?,
            keep_alive_timeout: parse_duration(
                self.keep_alive_timeout.as_deref(),
                &field("keep_alive_timeout"),
            )?,
            max_conn: self.max_conn,
            disable_keep_alives: self.disable_keep_alives,
            disable_compression: self.disable_compression,
            raw_proxy: self.raw_proxy,
            client_ip_header,
            shutdown_wait: parse_duration(self.shutdown_wait.as_deref(), &field("shutdown_wait"))?
                .unwrap_or_default(),
        })
    }

    pub fn to_definition(&self) -> ValidationResult<HandlerDefinition> {
        self.definition_with(DEFAULT_HEALTH_TIMEOUT)
    }

    fn definition_with(&self, default_timeout: Duration) -> ValidationResult<HandlerDefinition> {
        let targets = self
            .hosts
            .iter()
            .map(|host| host.to_spec(&self.key, default_timeout))
            .collect::<ValidationResult<Vec<_>>>()?;

        Ok(HandlerDefinition {
            key: self.key.clone(),
            strategy: self.effective_strategy().to_string(),
            routes: self.routes.clone(),
            middleware: self.middleware.clone(),
            targets,
            settings: self.to_settings()?,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SecondsOrText {
    Seconds(u64),
    Text(String),
}

/// Accept either a number of seconds or a duration string.
fn seconds_or_duration<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<SecondsOrText>::deserialize(deserializer)?.map(|value| match value {
            SecondsOrText::Seconds(secs) => format!("{secs}s"),
            SecondsOrText::Text(text) => text,
        }),
    )
}

/// Parse an optional duration; empty strings count as unset and a bare
/// number is read as seconds.
pub fn parse_duration(value: Option<&str>, field: &str) -> ValidationResult<Option<Duration>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) if raw.bytes().all(|b| b.is_ascii_digit()) => raw
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("invalid duration '{raw}': {e}"),
            }),
        Some(raw) => humantime::parse_duration(raw)
            .map(Some)
            .map_err(|e| ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("invalid duration '{raw}': {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strategy::{RANDOM, ROUND_ROBIN};

    #[test]
    fn test_host_timeout_accepts_whole_seconds() {
        let host: HostConfig =
            serde_json::from_str(r#"{"target": "http://a:80", "timeout": 7}"#).unwrap();
        assert_eq!(host.timeout.as_deref(), Some("7s"));
        let spec = host.to_spec("api", DEFAULT_HEALTH_TIMEOUT).unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(7));

        let host: HostConfig =
            serde_json::from_str(r#"{"target": "http://a:80", "timeout": "250ms"}"#).unwrap();
        let spec = host.to_spec("api", DEFAULT_HEALTH_TIMEOUT).unwrap();
        assert_eq!(spec.timeout, Duration::from_millis(250));

        assert_eq!(
            parse_duration(Some("3"), "timeout").unwrap(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"handlers": []}"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert!(config.health_check.enabled);
        assert_eq!(config.health_check.interval(), Duration::from_secs(15));
        assert_eq!(config.stats, StatsBackend::Noop);

        let host: HostConfig = serde_json::from_str(r#"{"target": "http://a:80"}"#).unwrap();
        assert_eq!(host.weight, 1);
        assert!(!host.down);
    }

    #[test]
    fn test_ip_hash_overrides_strategy() {
        let mut handler = HandlerConfig::new("api");
        handler.strategy = RANDOM.to_string();
        assert_eq!(handler.effective_strategy(), RANDOM);

        handler.ip_hash = true;
        assert_eq!(handler.to_definition().unwrap().strategy, IP_HASH);
    }

    #[test]
    fn test_to_definition_converts_durations() {
        let mut handler = HandlerConfig::new("api");
        handler.routes = vec!["/api/*".to_string()];
        handler.dial_timeout = Some("2s".to_string());
        handler.shutdown_wait = Some("250ms".to_string());
        handler.client_ip_header = Some("X-Client-IP".to_string());
        handler.hosts = vec![HostConfig {
            timeout: Some("3s".to_string()),
            health: Some(String::new()),
            ..HostConfig::new("http://10.0.0.1:80")
        }];

        let def = handler.to_definition().unwrap();
        assert_eq!(def.strategy, ROUND_ROBIN);
        assert_eq!(def.settings.dial_timeout, Some(Duration::from_secs(2)));
        assert_eq!(def.settings.response_header_timeout, None);
        assert_eq!(def.settings.shutdown_wait, Duration::from_millis(250));
        assert_eq!(
            def.settings.client_ip_header.as_ref().map(HeaderName::as_str),
            Some("x-client-ip")
        );
        assert_eq!(def.targets[0].timeout, Duration::from_secs(3));
        assert_eq!(def.targets[0].health, None);
    }

    #[test]
    fn test_server_health_timeout_is_host_default() {
        let mut handler = HandlerConfig::new("api");
        handler.hosts = vec![
            HostConfig::new("http://10.0.0.1:80"),
            HostConfig {
                timeout: Some("1s".to_string()),
                ..HostConfig::new("http://10.0.0.2:80")
            },
        ];
        let config = ServerConfig {
            health_check: HealthCheckConfig {
                timeout_secs: 9,
                ..HealthCheckConfig::default()
            },
            handlers: vec![handler],
            ..ServerConfig::default()
        };

        let defs = config.definitions().unwrap();
        assert_eq!(defs[0].targets[0].timeout, Duration::from_secs(9));
        assert_eq!(defs[0].targets[1].timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let mut handler = HandlerConfig::new("api");
        handler.keep_alive_timeout = Some("soon".to_string());
        let err = handler.to_settings().unwrap_err();
        assert!(err.to_string().contains("keep_alive_timeout"));
    }
}
