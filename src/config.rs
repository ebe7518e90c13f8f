use {
    crate::{backend::memory::DEFAULT_HISTORY_CAPACITY, error::Error},
    serde::Deserialize,
    std::time::Duration,
};

///
/// Selects and configures the store backend.
///
/// Passed explicitly to [`crate::Store::connect`], there is no process-wide registry of backends.
///
/// ```
/// use kv_mutex::config::StoreConfig;
///
/// let config = StoreConfig::from_json(
///     r#"{ "backend": "etcd", "endpoints": ["10.0.0.1:2379"], "connection_timeout_ms": 3000 }"#,
/// ).expect("valid config");
/// assert!(matches!(config, StoreConfig::Etcd(_)));
/// ```
///
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Etcd(EtcdConfig),
    Memory(MemoryConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub connection_timeout_ms: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self {
            StoreConfig::Etcd(etcd) => etcd.validate(),
            StoreConfig::Memory(memory) if memory.history_capacity == 0 => Err(
                Error::InvalidConfig("history_capacity must be at least 1".to_string()),
            ),
            StoreConfig::Memory(_) => Ok(()),
        }
    }
}

impl EtcdConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.endpoints.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one etcd endpoint is required".to_string(),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::InvalidConfig(
                "username and password must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    ///
    /// Endpoints with an `http://` scheme added where none was given.
    ///
    pub fn endpoint_urls(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                if endpoint.contains("://") {
                    endpoint.clone()
                } else {
                    format!("http://{endpoint}")
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etcd_config_should_default_scheme() {
        let config = StoreConfig::from_json(
            r#"{ "backend": "etcd", "endpoints": ["localhost:2379", "https://10.0.0.2:2379"] }"#,
        )
        .expect("parse");
        let StoreConfig::Etcd(etcd) = config else {
            panic!("expected etcd config");
        };
        assert_eq!(
            etcd.endpoint_urls(),
            vec!["http://localhost:2379", "https://10.0.0.2:2379"]
        );
        assert_eq!(etcd.connection_timeout(), None);
    }

    #[test]
    fn memory_config_should_use_default_history() {
        let config = StoreConfig::from_json(r#"{ "backend": "memory" }"#).expect("parse");
        let StoreConfig::Memory(memory) = config else {
            panic!("expected memory config");
        };
        assert_eq!(memory.history_capacity, DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn invalid_configs_should_be_rejected() {
        let no_endpoint = StoreConfig::from_json(r#"{ "backend": "etcd", "endpoints": [] }"#);
        assert!(matches!(no_endpoint, Err(Error::InvalidConfig(_))));

        let half_credentials = StoreConfig::from_json(
            r#"{ "backend": "etcd", "endpoints": ["a:1"], "username": "root" }"#,
        );
        assert!(matches!(half_credentials, Err(Error::InvalidConfig(_))));

        let unknown = StoreConfig::from_json(r#"{ "backend": "zookeeper" }"#);
        assert!(matches!(unknown, Err(Error::InvalidConfig(_))));
    }
}
