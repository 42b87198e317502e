use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use mbc_sdk::CqrsConfig;

use crate::error::{ServerError, ServerResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Largest accepted request body (CSV and ZIP uploads).
    pub max_body_bytes: usize,
    /// Allow cross-origin requests from any origin.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            max_body_bytes: 32 * 1024 * 1024,
            cors: false,
        }
    }
}

/// An import table served by the generic attribute pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Name used in import requests.
    pub name: String,
    /// Logical type; records land in `pk = {kind}#{tenant}`.
    pub kind: String,
    /// Columns that must be present and non-empty.
    #[serde(default)]
    pub required: Vec<String>,
}

/// Everything the `mbc serve` process reads from its TOML file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub core: CqrsConfig,
    pub tables: Vec<TableConfig>,
}

impl AppConfig {
    pub fn from_toml(text: &str) -> ServerResult<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }
}
