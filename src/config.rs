//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `OCPP_BRIDGE_LISTEN`,
//!    `OCPP_BRIDGE_BACKEND_HOST`, `OCPP_BRIDGE_BACKEND_PORT`,
//!    `OCPP_BRIDGE_API_KEY`
//! 2. **Config file**: path via `--config <path>`, or `ocpp-bridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [proxy]
//! listen = "0.0.0.0:8888"
//! backend_host = "192.168.0.150"
//! backend_port = 8887
//! connect_timeout_ms = 10000
//!
//! [logging]
//! level = "info"
//! message_log = "/var/log/ocpp-bridge/messages.jsonl"
//!
//! # Optional: omit entirely to disable the dashboard API
//! [dashboard]
//! listen = "127.0.0.1:8890"
//! api_key = "your-secret-key"
//!
//! # Ordered; blocking rules first, conversions before standardization.
//! [[rules]]
//! kind = "configuration_allow_list"
//! keys = ["HeartbeatInterval", "MeterValueSampleInterval"]
//!
//! [[rules]]
//! kind = "rate_unit_conversion"
//! direction = "backend_to_device"
//! actions = ["SetChargingProfile"]
//! factor = 230
//!
//! [[workarounds]]
//! kind = "canned_response"
//! action = "TriggerMessage"
//! direction = "backend_to_device"
//! payload = { status = "Accepted" }
//! ```
//!
//! When the file has no `[[rules]]`, [`default_rules`] is used.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::ocpp::{Action, Direction, Side};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Optional dashboard HTTP API.
    pub dashboard: Option<DashboardConfig>,
    /// Ordered transform rules.
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleEntry>,
    /// Auto-response workarounds.
    #[serde(default)]
    pub workarounds: Vec<WorkaroundEntry>,
}

/// Listener, backend target and relay limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Device-facing socket address (default `0.0.0.0:8888`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Backend host (default `192.168.0.150`).
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    /// Backend port (default 8887).
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    /// Connect to the backend with `wss://` instead of `ws://`.
    #[serde(default)]
    pub backend_tls: bool,
    /// Backend connect timeout in milliseconds (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Subprotocols accepted from devices, in preference order.
    #[serde(default = "default_supported_subprotocols")]
    pub supported_subprotocols: Vec<String>,
    /// Offered to the backend when the device offers none (default `ocpp1.6`).
    #[serde(default = "default_subprotocol")]
    pub default_subprotocol: String,
    /// Frame records kept per session for the dashboard (default 200).
    #[serde(default = "default_frame_buffer_size")]
    pub frame_buffer_size: usize,
    /// Consecutive undecodable frames before a session is closed (default 50, 0 = never).
    #[serde(default = "default_max_decode_failures")]
    pub max_decode_failures: u32,
    /// Seconds an unanswered request stays in the in-flight map (default 300,
    /// 0 = until the session ends).
    #[serde(default = "default_in_flight_ttl_secs")]
    pub in_flight_ttl_secs: u64,
    /// Capacity of each socket's outbound queue (default 256).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Largest accepted WebSocket message in bytes (default 1 MB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append-only JSONL file receiving every frame record. `None` disables it.
    pub message_log: Option<String>,
    /// Records buffered between the relay and the journal writer (default 10 000).
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
}

/// Identity caching across messages and reconnects.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Device Call payloads remembered per charge point (default `BootNotification`).
    #[serde(default = "default_cache_actions")]
    pub cache_actions: Vec<Action>,
    /// Seconds a cached identity outlives its session (default 86 400).
    #[serde(default = "default_identity_ttl")]
    pub ttl_secs: u64,
}

/// Dashboard HTTP API.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Socket address to bind (default `127.0.0.1:8890`).
    #[serde(default = "default_dashboard_listen")]
    pub listen: String,
    /// Pre-shared Bearer token. Override with `OCPP_BRIDGE_API_KEY`.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// One entry of the ordered rule list.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    /// Name used in logs and frame records (defaults to the kind).
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the kind's default direction.
    pub direction: Option<Direction>,
    /// Overrides the kind's default action filter.
    pub actions: Option<Vec<Action>>,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// Rule kinds and their parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    TimestampFix,
    IdTagTruncate {
        #[serde(default = "default_id_tag_max_len")]
        max_len: usize,
    },
    MeasurandScale {
        #[serde(default = "default_measurand_factor")]
        factor: f64,
        #[serde(default = "default_watt_unit")]
        unit: String,
        measurand: Option<String>,
    },
    RateUnitConversion {
        #[serde(default = "default_from_unit")]
        from_unit: String,
        #[serde(default = "default_watt_unit")]
        to_unit: String,
        #[serde(default = "default_rate_factor")]
        factor: f64,
        #[serde(default = "default_unit_field")]
        unit_field: String,
        #[serde(default = "default_limit_field")]
        limit_field: String,
    },
    ScheduleStandardize {
        #[serde(default = "default_profile_id")]
        profile_id: i64,
        #[serde(default)]
        stack_level: i64,
        #[serde(default = "default_profile_purpose")]
        purpose: String,
        #[serde(default = "default_profile_kind")]
        profile_kind: String,
        #[serde(default)]
        connector_id: i64,
        number_phases: Option<i64>,
        #[serde(default = "default_unit_field")]
        unit_field: String,
        #[serde(default = "default_limit_field")]
        limit_field: String,
    },
    ConfigurationAllowList {
        keys: Vec<String>,
        /// Answer blocked requests with `{"status": reply_status}`.
        #[serde(default = "default_true")]
        reply: bool,
        #[serde(default = "default_reply_status")]
        reply_status: String,
    },
    BlockAction {
        /// CallResult payload sent back to the requester.
        reply: Option<Value>,
        /// CallError code sent back instead, when `reply` is unset.
        reply_error: Option<String>,
    },
}

impl RuleKind {
    /// Snake-case kind name, the default rule name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimestampFix => "timestamp_fix",
            Self::IdTagTruncate { .. } => "id_tag_truncate",
            Self::MeasurandScale { .. } => "measurand_scale",
            Self::RateUnitConversion { .. } => "rate_unit_conversion",
            Self::ScheduleStandardize { .. } => "schedule_standardize",
            Self::ConfigurationAllowList { .. } => "configuration_allow_list",
            Self::BlockAction { .. } => "block_action",
        }
    }
}

/// One auto-response workaround.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkaroundEntry {
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: WorkaroundKind,
}

/// Workaround shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkaroundKind {
    /// Answer `action` immediately; string values `{{now}}` in `payload`
    /// become the current time.
    CannedResponse {
        action: Action,
        direction: Direction,
        #[serde(default = "default_empty_object")]
        payload: Value,
        #[serde(default = "default_true")]
        forward: bool,
    },
    /// Rewrite the outcome of responses to `action`.
    StatusOverride {
        action: Action,
        direction: Direction,
        match_status: Option<String>,
        match_error_code: Option<String>,
        replace_status: String,
    },
    /// Send a Call built from a cached payload some time after a trigger.
    Inject {
        trigger_action: Action,
        trigger_direction: Direction,
        #[serde(default)]
        delay_ms: u64,
        target: Side,
        action: Action,
        from_cache: Option<Action>,
    },
}

impl WorkaroundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CannedResponse { .. } => "canned_response",
            Self::StatusOverride { .. } => "status_override",
            Self::Inject { .. } => "inject",
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_listen() -> String {
    "0.0.0.0:8888".to_string()
}
fn default_backend_host() -> String {
    "192.168.0.150".to_string()
}
fn default_backend_port() -> u16 {
    8887
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_supported_subprotocols() -> Vec<String> {
    ["ocpp1.6", "ocpp2.0.1", "ocpp2.0", "ocpp1.5"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_subprotocol() -> String {
    "ocpp1.6".to_string()
}
fn default_frame_buffer_size() -> usize {
    200
}
fn default_max_decode_failures() -> u32 {
    50
}
fn default_in_flight_ttl_secs() -> u64 {
    300
}
fn default_channel_capacity() -> usize {
    256
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_message_log_capacity() -> usize {
    10_000
}
fn default_cache_actions() -> Vec<Action> {
    vec![Action::BootNotification]
}
fn default_identity_ttl() -> u64 {
    24 * 60 * 60
}
fn default_dashboard_listen() -> String {
    "127.0.0.1:8890".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_id_tag_max_len() -> usize {
    20
}
fn default_measurand_factor() -> f64 {
    10.0
}
fn default_watt_unit() -> String {
    "W".to_string()
}
fn default_from_unit() -> String {
    "A".to_string()
}
fn default_rate_factor() -> f64 {
    230.0
}
fn default_unit_field() -> String {
    "chargingRateUnit".to_string()
}
fn default_limit_field() -> String {
    "limit".to_string()
}
fn default_profile_id() -> i64 {
    231
}
fn default_profile_purpose() -> String {
    "TxDefaultProfile".to_string()
}
fn default_profile_kind() -> String {
    "Absolute".to_string()
}
fn default_reply_status() -> String {
    "Rejected".to_string()
}
fn default_empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Rule list used when the config file names none: the device-side field
/// fixes on, every other kind present but off.
pub fn default_rules() -> Vec<RuleEntry> {
    let entry = |enabled: bool, kind: RuleKind| RuleEntry {
        name: None,
        enabled,
        direction: None,
        actions: None,
        kind,
    };
    vec![
        entry(
            false,
            RuleKind::ConfigurationAllowList {
                keys: Vec::new(),
                reply: true,
                reply_status: default_reply_status(),
            },
        ),
        entry(true, RuleKind::TimestampFix),
        entry(
            true,
            RuleKind::IdTagTruncate {
                max_len: default_id_tag_max_len(),
            },
        ),
        entry(
            true,
            RuleKind::MeasurandScale {
                factor: default_measurand_factor(),
                unit: default_watt_unit(),
                measurand: None,
            },
        ),
        entry(
            false,
            RuleKind::RateUnitConversion {
                from_unit: default_from_unit(),
                to_unit: default_watt_unit(),
                factor: default_rate_factor(),
                unit_field: default_unit_field(),
                limit_field: default_limit_field(),
            },
        ),
        entry(
            false,
            RuleKind::ScheduleStandardize {
                profile_id: default_profile_id(),
                stack_level: 0,
                purpose: default_profile_purpose(),
                profile_kind: default_profile_kind(),
                connector_id: 0,
                number_phases: None,
                unit_field: default_unit_field(),
                limit_field: default_limit_field(),
            },
        ),
    ]
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend_host: default_backend_host(),
            backend_port: default_backend_port(),
            backend_tls: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            supported_subprotocols: default_supported_subprotocols(),
            default_subprotocol: default_subprotocol(),
            frame_buffer_size: default_frame_buffer_size(),
            max_decode_failures: default_max_decode_failures(),
            in_flight_ttl_secs: default_in_flight_ttl_secs(),
            channel_capacity: default_channel_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            message_log: None,
            message_log_capacity: default_message_log_capacity(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_actions: default_cache_actions(),
            ttl_secs: default_identity_ttl(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            logging: LoggingConfig::default(),
            identity: IdentityConfig::default(),
            dashboard: None,
            rules: default_rules(),
            workarounds: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Backend WebSocket URL for a normalized connection path.
    pub fn backend_url(&self, path: &str) -> String {
        let scheme = if self.backend_tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{path}", self.backend_host, self.backend_port)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `ocpp-bridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("ocpp-bridge.toml").exists() => Self::from_file("ocpp-bridge.toml")?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("OCPP_BRIDGE_LISTEN") {
            config.proxy.listen = listen;
        }
        if let Ok(host) = std::env::var("OCPP_BRIDGE_BACKEND_HOST") {
            config.proxy.backend_host = host;
        }
        if let Ok(port) = std::env::var("OCPP_BRIDGE_BACKEND_PORT") {
            config.proxy.backend_port = port.parse().map_err(|_| {
                ConfigError::Invalid(format!("OCPP_BRIDGE_BACKEND_PORT is not a port: {port}"))
            })?;
        }
        if let Ok(key) = std::env::var("OCPP_BRIDGE_API_KEY") {
            if let Some(dashboard) = config.dashboard.as_mut() {
                dashboard.api_key = key;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "proxy.channel_capacity must be at least 1".into(),
            ));
        }
        if self.proxy.frame_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "proxy.frame_buffer_size must be at least 1".into(),
            ));
        }
        if self.logging.message_log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "logging.message_log_capacity must be at least 1".into(),
            ));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

impl RuleEntry {
    /// Name used in logs and frame records.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let name = self.display_name();
        let bad_factor = |factor: f64| !factor.is_finite() || factor == 0.0;
        match &self.kind {
            RuleKind::IdTagTruncate { max_len } if *max_len == 0 => Err(ConfigError::Invalid(
                format!("rule {name}: max_len must be at least 1"),
            )),
            RuleKind::MeasurandScale { factor, unit, .. } => {
                if bad_factor(*factor) {
                    return Err(ConfigError::Invalid(format!(
                        "rule {name}: factor must be a non-zero number"
                    )));
                }
                if unit.is_empty() {
                    return Err(ConfigError::Invalid(format!("rule {name}: unit is empty")));
                }
                Ok(())
            }
            RuleKind::RateUnitConversion {
                from_unit,
                to_unit,
                factor,
                unit_field,
                limit_field,
            } => {
                if bad_factor(*factor) {
                    return Err(ConfigError::Invalid(format!(
                        "rule {name}: factor must be a non-zero number"
                    )));
                }
                if [from_unit, to_unit, unit_field, limit_field]
                    .iter()
                    .any(|s| s.is_empty())
                {
                    return Err(ConfigError::Invalid(format!(
                        "rule {name}: units and field names must not be empty"
                    )));
                }
                Ok(())
            }
            RuleKind::BlockAction { .. } if self.actions.as_ref().map_or(true, Vec::is_empty) => {
                Err(ConfigError::Invalid(format!(
                    "rule {name}: block_action needs a non-empty actions list"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.proxy.listen, "0.0.0.0:8888");
        assert_eq!(config.proxy.backend_port, 8887);
        assert_eq!(config.proxy.in_flight_ttl_secs, 300);
        assert!(config.dashboard.is_none());
        assert_eq!(config.rules.len(), default_rules().len());
        assert!(config.workarounds.is_empty());
    }

    #[test]
    fn default_rules_enable_device_field_fixes_only() {
        let enabled: Vec<&str> = default_rules()
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.kind.as_str())
            .collect();
        assert_eq!(
            enabled,
            vec!["timestamp_fix", "id_tag_truncate", "measurand_scale"]
        );
    }

    #[test]
    fn parses_rule_list_in_order() {
        let config = Config::from_toml(
            r#"
            [[rules]]
            kind = "configuration_allow_list"
            keys = ["HeartbeatInterval"]

            [[rules]]
            kind = "rate_unit_conversion"
            enabled = false
            direction = "device_to_backend"
            actions = ["SetLimit"]
            factor = 100
            unit_field = "unit"

            [[rules]]
            kind = "timestamp_fix"
            "#,
        )
        .unwrap();

        assert_eq!(config.rules.len(), 3);
        assert!(matches!(
            config.rules[0].kind,
            RuleKind::ConfigurationAllowList { ref keys, reply: true, .. } if keys == &["HeartbeatInterval"]
        ));
        let conv = &config.rules[1];
        assert!(!conv.enabled);
        assert_eq!(conv.direction, Some(Direction::DeviceToBackend));
        assert_eq!(conv.actions, Some(vec![Action::Other("SetLimit".into())]));
        match &conv.kind {
            RuleKind::RateUnitConversion {
                factor, unit_field, ..
            } => {
                assert!((factor - 100.0).abs() < f64::EPSILON);
                assert_eq!(unit_field, "unit");
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(matches!(config.rules[2].kind, RuleKind::TimestampFix));
    }

    #[test]
    fn parses_workarounds() {
        let config = Config::from_toml(
            r#"
            [[workarounds]]
            kind = "canned_response"
            action = "TriggerMessage"
            direction = "backend_to_device"
            payload = { status = "Accepted" }

            [[workarounds]]
            kind = "inject"
            enabled = false
            trigger_action = "TriggerMessage"
            trigger_direction = "backend_to_device"
            delay_ms = 2000
            target = "backend"
            action = "BootNotification"
            "#,
        )
        .unwrap();

        assert_eq!(config.workarounds.len(), 2);
        match &config.workarounds[0].kind {
            WorkaroundKind::CannedResponse {
                payload, forward, ..
            } => {
                assert_eq!(payload["status"], "Accepted");
                assert!(*forward);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(!config.workarounds[1].enabled);
    }

    #[test]
    fn unknown_rule_kind_is_a_parse_error() {
        let err = Config::from_toml("[[rules]]\nkind = \"teleport\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn backend_url_uses_scheme_and_path() {
        let mut proxy = ProxyConfig::default();
        assert_eq!(proxy.backend_url("/AcTec001"), "ws://192.168.0.150:8887/AcTec001");
        proxy.backend_tls = true;
        proxy.backend_host = "csms.example.com".into();
        proxy.backend_port = 443;
        assert_eq!(proxy.backend_url("/X"), "wss://csms.example.com:443/X");
    }

    #[test]
    fn invalid_rule_parameters_are_rejected() {
        let err = Config::from_toml("[[rules]]\nkind = \"measurand_scale\"\nfactor = 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml("[[rules]]\nkind = \"rate_unit_conversion\"\nto_unit = \"\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml("[[rules]]\nkind = \"block_action\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = Config::from_toml("[proxy]\nchannel_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
