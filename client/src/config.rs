use std::{env, fs, path::PathBuf, time::Duration};

use comms::typing::ClientId;
use engine::DType;
use serde::Deserialize;

use crate::{error::ClientErr, loop_::LoopConfig, retry::RetryPolicy};

/// Names the JSON file holding the configuration.
pub const CONFIG_PATH_VAR: &str = "CLIENT_CONFIG";

const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:9092";
const DEFAULT_DEVICE: &str = "cpu";
const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Shape of the generated dataset used when no dataset file is given.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticData {
    pub samples: usize,
    pub features: usize,
    pub seed: u64,
}

impl Default for SyntheticData {
    fn default() -> Self {
        Self {
            samples: 256,
            features: 4,
            seed: 7,
        }
    }
}

/// Process configuration, read once at startup.
///
/// Values come from the JSON file named by `CLIENT_CONFIG`, if any, then from
/// environment overrides. Missing values take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub coordinator_addr: String,
    pub client_id: Option<String>,
    pub device: String,
    /// CSV file with the local samples, the last column being the target.
    pub dataset_path: Option<PathBuf>,
    /// Element type of the model tensors, `f32` or `f16`.
    pub tensor_type: String,
    pub network_timeout_ms: u64,
    pub compute_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    pub max_frame_len: usize,
    pub retry: RetryPolicy,
    pub synthetic: SyntheticData,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: DEFAULT_COORDINATOR_ADDR.into(),
            client_id: None,
            device: DEFAULT_DEVICE.into(),
            dataset_path: None,
            tensor_type: DType::F32.tag().into(),
            network_timeout_ms: DEFAULT_NETWORK_TIMEOUT_MS,
            compute_timeout_ms: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_frame_len: comms::DEFAULT_MAX_FRAME_LEN,
            retry: RetryPolicy::default(),
            synthetic: SyntheticData::default(),
        }
    }
}

impl ClientConfig {
    /// Loads the configuration from the process environment and validates it.
    pub fn load() -> Result<Self, ClientErr> {
        let mut cfg = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a JSON configuration file.
    pub fn from_file(path: &str) -> Result<Self, ClientErr> {
        let content = fs::read_to_string(path)
            .map_err(|e| ClientErr::Config(format!("cannot read '{path}': {e}")))?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ClientErr> {
        serde_json::from_str(content).map_err(|e| ClientErr::Config(format!("invalid JSON: {e}")))
    }

    /// Overrides fields from environment variables.
    ///
    /// # Args
    /// * `var` - Looks a variable up by name.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ClientErr>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = var("COORDINATOR_ADDR") {
            self.coordinator_addr = addr;
        }
        if let Some(id) = var("CLIENT_ID") {
            self.client_id = Some(id);
        }
        if let Some(device) = var("DEVICE") {
            self.device = device;
        }
        if let Some(path) = var("DATASET_PATH") {
            self.dataset_path = Some(path.into());
        }
        if let Some(ms) = var("NETWORK_TIMEOUT_MS") {
            self.network_timeout_ms = parse_var("NETWORK_TIMEOUT_MS", &ms)?;
        }
        if let Some(max) = var("MAX_RETRIES") {
            self.retry.max_consecutive_failures = parse_var("MAX_RETRIES", &max)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ClientErr> {
        validate_addr(&self.coordinator_addr)?;

        if self.client_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ClientErr::Config("client_id must not be empty".into()));
        }
        if self.device != DEFAULT_DEVICE {
            return Err(ClientErr::Config(format!(
                "unsupported device '{}', only '{DEFAULT_DEVICE}' is available",
                self.device
            )));
        }
        if DType::from_tag(&self.tensor_type).is_none() {
            return Err(ClientErr::Config(format!(
                "unknown tensor_type '{}', expected 'f32' or 'f16'",
                self.tensor_type
            )));
        }
        if self.network_timeout_ms == 0 {
            return Err(ClientErr::Config("network_timeout_ms must be positive".into()));
        }
        if self.compute_timeout_ms == Some(0) {
            return Err(ClientErr::Config("compute_timeout_ms must be positive".into()));
        }
        if self.dataset_path.is_none()
            && (self.synthetic.samples == 0 || self.synthetic.features == 0)
        {
            return Err(ClientErr::Config(
                "synthetic.samples and synthetic.features must be positive".into(),
            ));
        }

        self.retry.validate().map_err(ClientErr::Config)
    }

    /// The configured identity, or a freshly generated one.
    pub fn client_id(&self) -> ClientId {
        match &self.client_id {
            Some(id) => ClientId::new(id.trim()),
            None => ClientId::generate(),
        }
    }

    pub fn dtype(&self) -> DType {
        DType::from_tag(&self.tensor_type).unwrap_or(DType::F32)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            network_timeout: Duration::from_millis(self.network_timeout_ms),
            compute_timeout: self.compute_timeout_ms.map(Duration::from_millis),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retry: self.retry.clone(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ClientErr> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientErr::Config(format!("{name} has an invalid value '{value}'")))
}

/// Accepts `host:port`, including bracketed IPv6 hosts such as `[::1]:9092`.
fn validate_addr(addr: &str) -> Result<(), ClientErr> {
    let invalid = || ClientErr::Config(format!("coordinator_addr '{addr}' is not host:port"));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    port.parse::<u16>().map_err(|_| invalid())?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || (host.contains(':') && !addr.starts_with('[')) {
        return Err(invalid());
    }

    Ok(())
}
