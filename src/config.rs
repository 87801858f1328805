use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::BackendConfig;
use crate::preset::PresetDescriptor;

// Which protocol flavour the device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceKind {
    Videohub,
    Smartscope,
}

// Service configuration, read from flags with environment fallbacks
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vidhubcontrol",
    about = "Control Blackmagic Videohub and SmartScope devices",
    version
)]
pub struct ServiceConfig {
    /// Device host name or address
    #[arg(long, env = "VIDEOHUB_HOST", default_value = "localhost")]
    pub host: String,

    /// Device port (9990 for Videohub, 9992 for SmartScope)
    #[arg(long, env = "VIDEOHUB_PORT")]
    pub port: Option<u16>,

    /// Device type
    #[arg(long, value_enum, env = "VIDEOHUB_DEVICE", default_value_t = DeviceKind::Videohub)]
    pub device: DeviceKind,

    /// JSON file holding stored presets; updated when presets change
    #[arg(long, value_name = "PATH", env = "VIDEOHUB_PRESETS")]
    pub presets: Option<PathBuf>,

    /// Seconds to wait before reconnecting
    #[arg(long, env = "VIDEOHUB_RECONNECT_SECS", default_value_t = 5)]
    pub reconnect_secs: u64,

    /// Print the JSON schema of accepted actions and exit
    #[arg(long)]
    pub print_schema: bool,
}

impl ServiceConfig {
    pub fn backend(&self) -> BackendConfig {
        BackendConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    // Stored presets, or none when no file is configured or it doesn't exist yet
    pub fn load_presets(&self) -> Result<Vec<PresetDescriptor>> {
        match &self.presets {
            Some(path) if path.exists() => load_presets(path),
            _ => Ok(Vec::new()),
        }
    }
}

pub fn load_presets(path: &Path) -> Result<Vec<PresetDescriptor>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read presets from {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse presets in {}", path.display()))
}

pub async fn save_presets(path: &Path, presets: &[PresetDescriptor]) -> Result<()> {
    let text = serde_json::to_string_pretty(presets)?;
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("Failed to write presets to {}", path.display()))
}
