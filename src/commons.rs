use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::{
    executor::{ExecutorOptions, DEFAULT_CONCURRENCY, DEFAULT_INTERVAL},
    repository::DEFAULT_STEP_SIZE,
    router::{Broker, RouterServerOptions},
    task::TaskOptions,
};

const DEFAULT_MAX_RPC_CALLS_PER_SECOND: u32 = 10;
const DEFAULT_NEW_LOGS_POLL_INTERVAL_MS: u64 = 3_000;

fn default_step_size() -> u64 {
    DEFAULT_STEP_SIZE
}

fn default_max_rpc_calls_per_second() -> u32 {
    DEFAULT_MAX_RPC_CALLS_PER_SECOND
}

fn default_new_logs_poll_interval_ms() -> u64 {
    DEFAULT_NEW_LOGS_POLL_INTERVAL_MS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub ws_rpc_endpoint: String,
    #[serde(default = "default_step_size")]
    pub logs_step_size: u64,
    #[serde(default = "default_max_rpc_calls_per_second")]
    pub max_rpc_calls_per_second: u32,
    /// Restricts fetching and caching to these contracts.
    #[serde(default)]
    pub addresses: Option<Vec<Address>>,
    /// Logs are cached in memory when missing.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_new_logs_poll_interval_ms")]
    pub new_logs_poll_interval_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub concurrency: usize,
    pub interval_ms: u64,
    pub aging_interval_ms: Option<u64>,
    pub task_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
            aging_interval_ms: None,
            task_timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    pub fn options(&self) -> ExecutorOptions {
        ExecutorOptions {
            concurrency: self.concurrency,
            interval: Duration::from_millis(self.interval_ms),
            aging_interval: self.aging_interval_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    pub forward_errors: bool,
    pub task_steps_range: u64,
    /// Redis reachable by the workers. Without it the router only serves clients living
    /// in this process.
    #[serde(default)]
    pub broker_redis_url: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forward_errors: false,
            task_steps_range: DEFAULT_STEP_SIZE,
            broker_redis_url: None,
        }
    }
}

impl RouterConfig {
    pub fn server_options(&self) -> RouterServerOptions {
        RouterServerOptions {
            forward_errors: self.forward_errors,
        }
    }
}

#[derive(Default, Debug, Serialize, Deserialize)]
pub struct Config {
    pub networks: HashMap<String, NetworkConfig>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

impl Config {
    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            steps_range: self.router.task_steps_range,
            timeout: self.executor.task_timeout_ms.map(Duration::from_millis),
        }
    }
}

pub struct NetworkExecutionContext {
    pub network: String,
    pub network_config: NetworkConfig,
    pub executor_options: ExecutorOptions,
    pub task_options: TaskOptions,
    pub server_options: RouterServerOptions,
    pub broker: Arc<dyn Broker>,
}

pub fn get_config(alt_path: Option<String>) -> anyhow::Result<Config> {
    let default_path = confy::get_configuration_file_path("", "logs-router")
        .context("could not get default config path for platform")?
        .to_string_lossy()
        .to_string();
    let raw_path = alt_path.unwrap_or(default_path);
    let path = Path::new(raw_path.as_str())
        .canonicalize()
        .context(format!("could not canonicalize config path {raw_path}"))?
        .to_string_lossy()
        .to_string();

    tracing::info!("using path {} to read config", path);
    confy::load_path::<Config>(path).context("could not read config")
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::Config;

    #[test]
    fn defaults_for_missing_sections() {
        let config: Config = serde_json::from_str(
            r#"{"networks":{"gnosis":{"chain_id":100,"ws_rpc_endpoint":"ws://localhost:8546"}}}"#,
        )
        .unwrap();
        let gnosis = config.networks.get("gnosis").unwrap();
        assert_eq!(gnosis.logs_step_size, 2_000);
        assert_eq!(gnosis.max_rpc_calls_per_second, 10);
        assert!(gnosis.addresses.is_none());
        assert!(!config.router.forward_errors);
        assert!(config.router.broker_redis_url.is_none());

        let options = config.executor.options();
        assert_eq!(options.concurrency, 10);
        assert_eq!(options.interval, Duration::from_millis(100));
        assert!(options.aging_interval.is_none());
        assert_eq!(config.task_options().timeout, None);
    }
}
