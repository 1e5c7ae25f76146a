//! Flat key-value configuration for one analyzer bridge instance.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Who dials whom on the analyzer-side TCP link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// The bridge connects out to the analyzer.
    Client,
    /// The bridge listens; the analyzer connects in.
    Server,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Client => write!(f, "client"),
            ConnectionMode::Server => write!(f, "server"),
        }
    }
}

/// Supported connection types. Anything else is refused at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CnxType {
    #[serde(rename = "socket")]
    Socket,
    #[serde(rename = "socket_E1381")]
    SocketE1381,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub id_analyzer: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub url_upstream_lab27: String,
    pub url_upstream_lab29: String,
    pub type_cnx: CnxType,
    #[serde(default)]
    pub type_msg: String,
    #[serde(default)]
    pub archive_msg: bool,
    #[serde(default = "default_operation_mode")]
    pub operation_mode: String,
    pub mode: ConnectionMode,
    pub ip_analyzer: String,
    pub port_analyzer: u16,
    #[serde(default)]
    pub mapping_path: Option<PathBuf>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_operation_mode() -> String {
    "batch".to_string()
}

impl AnalyzerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).context("invalid analyzer configuration")?;
        log::info!(
            "Configuration loaded for analyzer {} ({} mode, {}:{})",
            config.id_analyzer,
            config.mode,
            config.ip_analyzer,
            config.port_analyzer
        );
        Ok(config)
    }

    /// Analyzer endpoint as `ip:port`.
    pub fn analyzer_addr(&self) -> String {
        format!("{}:{}", self.ip_analyzer, self.port_analyzer)
    }
}
