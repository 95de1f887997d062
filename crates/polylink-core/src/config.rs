//! Interface configuration and startup bootstrap.
//!
//! Values are resolved in this order: the one-line JSON bootstrap read from
//! stdin, then the process environment (optionally pre-seeded from
//! `~/.polyglot/.env`), then the defaults below. The only value without a
//! default is the profile number.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PolyError, PolyResult};

/// Default values.
pub mod defaults {
    pub const MQTT_HOST: &str = "127.0.0.1";
    pub const MQTT_PORT: u16 = 1883;
    pub const NAMESPACE: &str = "udi/polyglot";
    pub const PEER_ID: &str = "polyglot";
    pub const KEEP_ALIVE_SECS: u64 = 10;
    pub const SHORT_POLL_SECS: u64 = 10;
    pub const LONG_POLL_SECS: u64 = 30;
    /// How long startup waits for the stdin bootstrap line
    pub const STDIN_WINDOW_MS: u64 = 1000;
}

/// Environment variable names.
pub mod env_vars {
    pub const PROFILE_NUM: &str = "PROFILE_NUM";
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const TOKEN: &str = "TOKEN";
    pub const NAMESPACE: &str = "POLYGLOT_NAMESPACE";
    pub const PEER_ID: &str = "POLYGLOT_PEER";
}

/// Reconnect behaviour of the transport.
///
/// The default is a single immediate attempt after a fault; `max_attempts:
/// None` keeps trying forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_max_attempts() -> Option<u32> {
    Some(1)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn unlimited(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Periods of the controller's poll timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub short_secs: u64,
    pub long_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            short_secs: defaults::SHORT_POLL_SECS,
            long_secs: defaults::LONG_POLL_SECS,
        }
    }
}

impl PollSettings {
    pub fn short(&self) -> Duration {
        Duration::from_secs(self.short_secs.max(1))
    }

    pub fn long(&self) -> Duration {
        Duration::from_secs(self.long_secs.max(1))
    }
}

/// Connection settings of the interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// This NodeServer's identity on the wire
    pub profile_num: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub namespace: String,
    /// Expected `node` value on inbound envelopes
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    /// Feature set announced in the connected envelope
    #[serde(default)]
    pub features: Value,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub polls: PollSettings,
}

impl InterfaceConfig {
    pub fn new(profile_num: impl Into<String>) -> Self {
        Self {
            profile_num: profile_num.into(),
            mqtt_host: defaults::MQTT_HOST.to_string(),
            mqtt_port: defaults::MQTT_PORT,
            username: None,
            password: None,
            namespace: defaults::NAMESPACE.to_string(),
            peer_id: defaults::PEER_ID.to_string(),
            client_id: None,
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            features: Value::Null,
            reconnect: ReconnectPolicy::default(),
            polls: PollSettings::default(),
        }
    }

    pub fn with_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.mqtt_host = host.into();
        self.mqtt_port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_features(mut self, features: Value) -> Self {
        self.features = features;
        self
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.mqtt_host, self.mqtt_port)
    }

    /// Resolve from the bootstrap line and the process environment.
    ///
    /// `fallback_var` names an extra environment variable consulted for the
    /// profile number when `PROFILE_NUM` is unset.
    pub fn resolve(bootstrap: Option<Bootstrap>, fallback_var: Option<&str>) -> PolyResult<Self> {
        Self::resolve_with(bootstrap, fallback_var, |key| std::env::var(key).ok())
    }

    /// Same as [`InterfaceConfig::resolve`] with an injectable environment.
    pub fn resolve_with<F>(
        bootstrap: Option<Bootstrap>,
        fallback_var: Option<&str>,
        env: F,
    ) -> PolyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bootstrap = bootstrap.unwrap_or_default();

        let profile_num = bootstrap
            .profile_num
            .or_else(|| env(env_vars::PROFILE_NUM))
            .or_else(|| fallback_var.and_then(&env))
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                PolyError::Identity("Profile Number not found in STDIN or environment".into())
            })?;

        let mut config = Self::new(profile_num.trim());

        if let Some(host) = bootstrap.mqtt_host.or_else(|| env(env_vars::MQTT_HOST)) {
            config.mqtt_host = host;
        }
        if let Some(port) = bootstrap.mqtt_port.or_else(|| env(env_vars::MQTT_PORT)) {
            config.mqtt_port = port.trim().parse().map_err(|_| {
                PolyError::Configuration(format!("invalid MQTT port: {}", port))
            })?;
        }
        config.username = env(env_vars::MQTT_USERNAME);
        config.password = bootstrap.token.or_else(|| env(env_vars::TOKEN));
        if let Some(ns) = env(env_vars::NAMESPACE) {
            config.namespace = ns;
        }
        if let Some(peer) = env(env_vars::PEER_ID) {
            config.peer_id = peer;
        }
        Ok(config)
    }
}

/// The one-line JSON object a supervisor may write to stdin at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bootstrap {
    pub profile_num: Option<String>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<String>,
    pub token: Option<String>,
}

impl Bootstrap {
    /// Parse the stdin line. Numbers and strings are both accepted.
    pub fn parse(line: &str) -> PolyResult<Self> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            profile_num: Option<Value>,
            mqtt_host: Option<String>,
            mqtt_port: Option<Value>,
            token: Option<String>,
        }

        fn scalar(value: Option<Value>) -> Option<String> {
            match value? {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        }

        let raw: Raw = serde_json::from_str(line.trim())?;
        Ok(Self {
            profile_num: scalar(raw.profile_num),
            mqtt_host: raw.mqtt_host,
            mqtt_port: scalar(raw.mqtt_port),
            token: raw.token,
        })
    }
}

/// Default location of the dotenv file written by the peer's installer.
pub fn default_env_file() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".polyglot").join(".env"))
}

/// Load `KEY=VALUE` lines into the process environment.
///
/// Variables already set are left untouched. Returns how many were set.
pub fn load_env_file(path: &Path) -> PolyResult<usize> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PolyError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })?;

    let mut loaded = 0;
    for (key, value) in parse_env_lines(&content) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, value);
            loaded += 1;
        } else {
            debug!(key = %key, "Environment already set, keeping existing value");
        }
    }
    info!("Loaded {} variables from {}", loaded, path.display());
    Ok(loaded)
}

/// Load the default env file if present. A missing file is only a warning.
pub fn load_default_env_file() {
    let Some(path) = default_env_file() else {
        return;
    };
    if !path.exists() {
        warn!("File does not exist: {}", path.display());
        return;
    }
    if let Err(e) = load_env_file(&path) {
        warn!("{}", e);
    }
}

fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_identity() {
        let err = InterfaceConfig::resolve_with(None, Some("MY_NS"), env_of(&[])).unwrap_err();
        assert!(matches!(err, PolyError::Identity(_)));
    }

    #[test]
    fn test_defaults_from_env() {
        let config =
            InterfaceConfig::resolve_with(None, None, env_of(&[("PROFILE_NUM", "3")])).unwrap();
        assert_eq!(config.profile_num, "3");
        assert_eq!(config.broker_addr(), "127.0.0.1:1883");
        assert_eq!(config.peer_id, "polyglot");
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_fallback_var() {
        let config =
            InterfaceConfig::resolve_with(None, Some("MY_NS"), env_of(&[("MY_NS", "12")])).unwrap();
        assert_eq!(config.profile_num, "12");
    }

    #[test]
    fn test_bootstrap_wins_over_env() {
        let bootstrap = Bootstrap::parse(
            r#"{"profileNum": 8, "mqttHost": "10.0.0.5", "mqttPort": "8883", "token": "abc"}"#,
        )
        .unwrap();
        let config = InterfaceConfig::resolve_with(
            Some(bootstrap),
            None,
            env_of(&[("PROFILE_NUM", "3"), ("MQTT_HOST", "ignored")]),
        )
        .unwrap();
        assert_eq!(config.profile_num, "8");
        assert_eq!(config.broker_addr(), "10.0.0.5:8883");
        assert_eq!(config.password.as_deref(), Some("abc"));
    }

    #[test]
    fn test_bad_port() {
        let err = InterfaceConfig::resolve_with(
            None,
            None,
            env_of(&[("PROFILE_NUM", "3"), ("MQTT_PORT", "http")]),
        )
        .unwrap_err();
        assert!(matches!(err, PolyError::Configuration(_)));
    }

    #[test]
    fn test_bootstrap_garbage() {
        assert!(Bootstrap::parse("hello").is_err());
    }

    #[test]
    fn test_reconnect_policy() {
        let single = ReconnectPolicy::default();
        assert!(single.allows(1));
        assert!(!single.allows(2));
        assert!(ReconnectPolicy::unlimited(Duration::from_secs(1)).allows(1000));
    }

    #[test]
    fn test_parse_env_lines() {
        let parsed = parse_env_lines("# comment\nPROFILE_NUM=4\nexport MQTT_HOST=\"10.0.0.1\"\n\nBROKEN\n");
        assert_eq!(
            parsed,
            vec![
                ("PROFILE_NUM".to_string(), "4".to_string()),
                ("MQTT_HOST".to_string(), "10.0.0.1".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "POLYLINK_TEST_ONLY_VAR=yes\n").unwrap();
        assert_eq!(load_env_file(&path).unwrap(), 1);
        assert_eq!(std::env::var("POLYLINK_TEST_ONLY_VAR").unwrap(), "yes");
        assert!(load_env_file(&dir.path().join("missing")).is_err());
    }
}
