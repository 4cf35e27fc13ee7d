use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Cluster identity stamped on every node request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: String,
}

/// Node RPC settings. Keys missing from a config file take the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Upper bound for one lifecycle call, connect included.
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,

    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,

    /// Maximum number of node addresses with a pooled client.
    pub max_clients: usize,

    /// Pooled clients unused for this long are dropped when room is needed.
    /// `null` keeps idle clients until the pool is full.
    #[serde(with = "opt_duration_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(1),
            max_clients: 64,
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Layout used when a space is created without explicit sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceDefaults {
    pub slot_count: u32,
    pub partition_count: u32,
}

impl Default for SpaceDefaults {
    fn default() -> Self {
        Self {
            slot_count: 1024,
            partition_count: 4,
        }
    }
}

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub space: SpaceDefaults,
}

impl MasterConfig {
    pub fn new(cluster_id: &str) -> Self {
        Self {
            cluster: ClusterConfig {
                cluster_id: cluster_id.to_string(),
            },
            rpc: RpcConfig::default(),
            space: SpaceDefaults::default(),
        }
    }

    /// Set the per-call RPC timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.rpc.request_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.rpc.connect_timeout = timeout;
        self
    }

    /// Set the maximum number of pooled node clients
    pub fn max_clients(mut self, max: usize) -> Self {
        self.rpc.max_clients = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rpc.idle_timeout = timeout;
        self
    }

    pub fn slot_count(mut self, slots: u32) -> Self {
        self.space.slot_count = slots;
        self
    }

    pub fn partition_count(mut self, partitions: u32) -> Self {
        self.space.partition_count = partitions;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, String> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| format!("Invalid config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
        Self::from_json_str(&json)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster.cluster_id.trim().is_empty() {
            return Err("cluster_id cannot be empty".to_string());
        }

        if self.rpc.request_timeout.is_zero() {
            return Err("request_timeout must be > 0".to_string());
        }

        if self.rpc.connect_timeout.is_zero() {
            return Err("connect_timeout must be > 0".to_string());
        }

        if self.rpc.max_clients == 0 {
            return Err("max_clients must be > 0".to_string());
        }

        if self.space.partition_count == 0 {
            return Err("partition_count must be > 0".to_string());
        }

        if self.space.partition_count > self.space.slot_count {
            return Err("partition_count cannot exceed slot_count".to_string());
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::new("c1");
        assert_eq!(config.rpc.request_timeout, Duration::from_secs(3));
        assert_eq!(config.space.slot_count, 1024);
        assert_eq!(config.space.partition_count, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MasterConfig::new("c1")
            .request_timeout(Duration::from_millis(250))
            .max_clients(2)
            .slot_count(64)
            .partition_count(8);

        assert_eq!(config.rpc.request_timeout, Duration::from_millis(250));
        assert_eq!(config.rpc.max_clients, 2);
        assert_eq!(config.space.slot_count, 64);
        assert_eq!(config.space.partition_count, 8);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = MasterConfig::from_json_str(
            r#"{"cluster": {"cluster_id": "prod"}, "rpc": {"request_timeout_ms": 1500, "connect_timeout_ms": 200, "max_clients": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.cluster.cluster_id, "prod");
        assert_eq!(config.rpc.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.rpc.idle_timeout, RpcConfig::default().idle_timeout);
        assert_eq!(config.space, SpaceDefaults::default());

        let config = MasterConfig::from_json_str(
            r#"{"cluster": {"cluster_id": "c"}, "rpc": {"max_clients": 1, "idle_timeout_ms": null}, "space": {"slot_count": 16}}"#,
        )
        .unwrap();
        assert_eq!(config.rpc.max_clients, 1);
        assert_eq!(config.rpc.request_timeout, Duration::from_secs(3));
        assert_eq!(config.rpc.idle_timeout, None);
        assert_eq!(config.space.slot_count, 16);
        assert_eq!(config.space.partition_count, 4);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cluster": {{"cluster_id": "file-cluster"}}}}"#).unwrap();
        let config = MasterConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.cluster.cluster_id, "file-cluster");
        assert_eq!(config.rpc, RpcConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        assert!(MasterConfig::new(" ").validate().is_err());
        assert!(MasterConfig::new("c1").max_clients(0).validate().is_err());
        assert!(MasterConfig::new("c1").slot_count(2).partition_count(3).validate().is_err());
        assert!(MasterConfig::from_json_str("{").is_err());
    }
}
