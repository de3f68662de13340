use std::time::Duration;

use thiserror::Error;
use vmfleet_reconcile::DEFAULT_BURST_REPLICAS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_url: String,
    pub token: Option<String>,
    pub namespace: Option<String>,
    pub log_level: String,
    pub pool_threads: usize,
    pub replicaset_threads: usize,
    pub burst_replicas: usize,
    pub resync_interval: Duration,
    pub controllers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8001".to_string(),
            token: None,
            namespace: None,
            log_level: "info".to_string(),
            pool_threads: 3,
            replicaset_threads: 3,
            burst_replicas: DEFAULT_BURST_REPLICAS,
            resync_interval: Duration::from_secs(5),
            controllers: vec!["pool".to_string(), "replicaset".to_string()],
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_url = lookup("VMFLEET_API_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        if api_url.is_empty() {
            return Err(ConfigError::Empty {
                name: "VMFLEET_API_URL",
            });
        }

        let token = lookup("VMFLEET_TOKEN").filter(|v| !v.is_empty());
        let namespace = lookup("VMFLEET_NAMESPACE").filter(|v| !v.is_empty());
        let log_level = lookup("VMFLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        let pool_threads = parse_count(&lookup, "VMFLEET_POOL_THREADS", defaults.pool_threads)?;
        let replicaset_threads = parse_count(
            &lookup,
            "VMFLEET_REPLICASET_THREADS",
            defaults.replicaset_threads,
        )?;
        let burst_replicas =
            parse_count(&lookup, "VMFLEET_BURST_REPLICAS", defaults.burst_replicas)?;
        let resync_secs = parse_count(
            &lookup,
            "VMFLEET_RESYNC_SECS",
            defaults.resync_interval.as_secs() as usize,
        )?;

        let controllers = match lookup("VMFLEET_CONTROLLERS") {
            Some(v) => {
                let names: Vec<String> = v
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if names.is_empty() {
                    return Err(ConfigError::Empty {
                        name: "VMFLEET_CONTROLLERS",
                    });
                }
                names
            }
            None => defaults.controllers,
        };

        Ok(Self {
            api_url,
            token,
            namespace,
            log_level,
            pool_threads,
            replicaset_threads,
            burst_replicas,
            resync_interval: Duration::from_secs(resync_secs as u64),
            controllers,
        })
    }

    /// Worker count for the named controller.
    pub fn threads_for(&self, controller: &str) -> usize {
        match controller {
            "replicaset" => self.replicaset_threads,
            _ => self.pool_threads,
        }
    }
}

fn parse_count<F>(lookup: &F, name: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::Invalid { name, value }),
        },
    }
}
