//! Configuration for the dummy HTTP server.
//!
//! Defines the listening socket, capture settings, and the ordered list of
//! response rules.

use crate::error::BuildError;
use crate::response::Response;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Binding address (`host:port`, or `:port` for all interfaces)
    pub address: String,

    /// Directory that receives one file per captured request
    pub capture_dir: PathBuf,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Write timeout in seconds
    pub write_timeout: u64,

    /// Maximum number of body bytes kept per captured request
    pub max_request_size: u64,

    /// Response rules, first match wins
    pub responses: Vec<ResponseConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ":8080".to_string(),
            capture_dir: PathBuf::from("var"),
            read_timeout: 15,
            write_timeout: 15,
            max_request_size: 1024 * 1024,
            responses: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string. An empty document yields the
    /// defaults.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Address in a form accepted by the socket layer.
    pub fn bind_address(&self) -> String {
        if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        }
    }

    /// Time allowed to read request headers and the captured body part.
    /// Zero disables the limit.
    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.read_timeout)
    }

    /// Time allowed to handle a request once its headers are read. Zero
    /// disables the limit.
    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.write_timeout)
    }

    /// Check every rule. Returns the index and error of each rule that would
    /// be skipped at startup; invalid rules are never fatal.
    pub fn validate(&self) -> Vec<(usize, BuildError)> {
        self.responses
            .iter()
            .enumerate()
            .filter_map(|(i, rule)| Response::from_config(rule).err().map(|e| (i, e)))
            .collect()
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// A single response rule as it appears in the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseConfig {
    /// Regular expression searched in the request path (empty = any path)
    pub path_pattern: String,

    /// Accepted methods (empty = any method)
    pub methods: Vec<String>,

    /// Content type of the reply (empty = header omitted)
    pub content_type: String,

    /// Base64 encoded reply body
    pub body: String,

    /// Do not capture requests answered by this rule
    pub skip_capture: bool,

    /// HTTP status code (0 = 200)
    pub return_code: i64,
}
