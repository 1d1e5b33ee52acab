//! Bridge configuration.
//!
//! Defaults suit a phone running Pikafish; hosts override them through the
//! builder methods, a serialized config, or `XQBRIDGE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::error::{BridgeError, Result};

/// Serde adapter storing durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bound on the whole `uci`/`uciok` + `isready`/`readyok` exchange.
    #[serde(rename = "handshake_timeout_ms", with = "millis")]
    pub handshake_timeout: Duration,
    /// How long `stop()` waits for a graceful exit after `quit`.
    #[serde(rename = "stop_grace_ms", with = "millis")]
    pub stop_grace: Duration,
    /// How long a post-timeout `isready` probe may take before the engine is
    /// declared hung.
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
    /// Deadline applied to reply-awaiting commands sent without one.
    #[serde(rename = "default_deadline_ms", with = "millis::option")]
    pub default_deadline: Option<Duration>,
    pub queue_capacity: usize,
    pub event_capacity: usize,
    pub max_line_length: usize,
    pub engine_args: Vec<String>,
    /// Applied with `setoption` between `uciok` and `readyok` on every start.
    pub startup_options: Vec<(String, String)>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(3),
            default_deadline: None,
            queue_capacity: 64,
            event_capacity: 256,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            engine_args: Vec::new(),
            startup_options: Vec::new(),
        }
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| BridgeError::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()
    }

    /// Overlay `XQBRIDGE_*` environment variables.
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(d) = env_millis("XQBRIDGE_HANDSHAKE_TIMEOUT_MS")? {
            self.handshake_timeout = d;
        }
        if let Some(d) = env_millis("XQBRIDGE_STOP_GRACE_MS")? {
            self.stop_grace = d;
        }
        if let Some(d) = env_millis("XQBRIDGE_PROBE_TIMEOUT_MS")? {
            self.probe_timeout = d;
        }
        if let Some(d) = env_millis("XQBRIDGE_DEFAULT_DEADLINE_MS")? {
            self.default_deadline = Some(d);
        }
        self.validate()
    }

    pub fn validate(self) -> Result<Self> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::Config("queue_capacity must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(BridgeError::Config("event_capacity must be > 0".into()));
        }
        if self.max_line_length < 64 {
            return Err(BridgeError::Config("max_line_length must be >= 64".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BridgeError::Config("handshake_timeout must be > 0".into()));
        }
        Ok(self)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn with_event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n;
        self
    }

    pub fn with_engine_args(mut self, args: Vec<String>) -> Self {
        self.engine_args = args;
        self
    }

    pub fn with_startup_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.startup_options.push((name.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default().validate().unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.default_deadline, None);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = BridgeConfig::from_json(
            r#"{"handshake_timeout_ms": 2500, "startup_options": [["EvalFile", "pikafish.nnue"]]}"#,
        )
        .unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_millis(2500));
        assert_eq!(config.stop_grace, Duration::from_secs(2));
        assert_eq!(
            config.startup_options,
            vec![("EvalFile".to_string(), "pikafish.nnue".to_string())]
        );
    }

    #[test]
    fn json_rejects_zero_capacity() {
        let err = BridgeConfig::from_json(r#"{"queue_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn serializes_durations_as_millis() {
        let config = BridgeConfig::default().with_default_deadline(Some(Duration::from_secs(5)));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["handshake_timeout_ms"], 10_000);
        assert_eq!(json["default_deadline_ms"], 5_000);
    }

    #[test]
    fn builder_chains() {
        let config = BridgeConfig::new()
            .with_stop_grace(Duration::from_millis(100))
            .with_startup_option("Threads", "2")
            .with_engine_args(vec!["--quiet".into()]);
        assert_eq!(config.stop_grace, Duration::from_millis(100));
        assert_eq!(config.startup_options.len(), 1);
        assert_eq!(config.engine_args, vec!["--quiet"]);
    }
}
