use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How server ports are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortPolicy {
    /// Ask the OS for an ephemeral port (bind to 0, read it back).
    Ephemeral,
    /// Always use a fixed, well-known port. Intended for development and
    /// debugging; starting two servers under this policy will fail.
    Fixed(u16),
}

impl Default for PortPolicy {
    fn default() -> Self {
        PortPolicy::Ephemeral
    }
}

/// Configuration for the runtime manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Root directory for installed artifacts and in-flight archives.
    pub data_dir: PathBuf,
    /// Number of readiness polls before a starting server is declared failed.
    pub health_retries: u32,
    /// Pause between readiness polls.
    #[serde(with = "duration_millis")]
    pub health_interval: Duration,
    /// Per-request timeout for a single readiness poll or shutdown call.
    #[serde(with = "duration_millis")]
    pub health_request_timeout: Duration,
    /// Minimum interval between two download progress events.
    #[serde(with = "duration_millis")]
    pub progress_throttle: Duration,
    pub port_policy: PortPolicy,
    /// When false, a second `start` for a (model, runtime) pair that already
    /// has a non-stopped instance is rejected instead of binding a new port.
    pub allow_multiple_instances: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            health_retries: 30,
            health_interval: Duration::from_secs(1),
            health_request_timeout: Duration::from_secs(2),
            progress_throttle: Duration::from_millis(100),
            port_policy: PortPolicy::Ephemeral,
            allow_multiple_instances: true,
        }
    }
}

impl RuntimeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        let config = RuntimeConfig::default();
        assert_eq!(config.health_retries, 30);
        assert_eq!(config.health_interval, Duration::from_secs(1));
        assert!(config.allow_multiple_instances);
        assert_eq!(config.port_policy, PortPolicy::Ephemeral);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = RuntimeConfig {
            port_policy: PortPolicy::Fixed(8002),
            health_retries: 5,
            ..RuntimeConfig::new("/tmp/camtrap")
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port_policy, PortPolicy::Fixed(8002));
        assert_eq!(back.health_retries, 5);
        assert_eq!(back.data_dir, PathBuf::from("/tmp/camtrap"));
    }
}
