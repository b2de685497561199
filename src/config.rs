//! Persisted settings (TOML), shared by `wsync` and `wsyncd`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::plan::LocalRoots;
use crate::protocol::DEFAULT_PORT;
use crate::url::ServerAddr;

const SETTINGS_FILE: &str = "settings.toml";

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("wsync");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("wsync");
    }
    PathBuf::from(".wsync")
}

pub fn settings_path() -> PathBuf {
    config_dir().join(SETTINGS_FILE)
}

/// Base of the game's local data directory
fn local_data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(local);
        }
    }
    match std::env::var("HOME") {
        Ok(home) if cfg!(windows) => PathBuf::from(home).join("AppData").join("Local"),
        Ok(home) => PathBuf::from(home).join(".local").join("share"),
        Err(_) => PathBuf::from("."),
    }
}

fn addons_dir() -> PathBuf {
    local_data_dir()
        .join("Colossal Order")
        .join("Cities_Skylines")
        .join("Addons")
}

fn default_content_root() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files (x86)\Steam\steamapps\workshop\content\255710")
    } else {
        local_data_dir()
            .join("Steam")
            .join("steamapps")
            .join("workshop")
            .join("content")
            .join("255710")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub listen_port: u16,
    pub content_root: PathBuf,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            content_root: default_content_root(),
        }
    }
}

impl HostSettings {
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_ip: String,
    pub server_port: u16,
    pub assets_path: PathBuf,
    pub mods_path: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_ip: "25.0.0.1".to_string(),
            server_port: DEFAULT_PORT,
            assets_path: addons_dir().join("Assets"),
            mods_path: addons_dir().join("Mods"),
        }
    }
}

impl ClientSettings {
    pub fn roots(&self) -> LocalRoots {
        LocalRoots::new(self.assets_path.clone(), self.mods_path.clone())
    }

    /// `host:port`, with IPv6 hosts in brackets
    pub fn address(&self) -> String {
        ServerAddr {
            host: self.server_ip.clone(),
            port: self.server_port,
        }
        .to_string()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: HostSettings,
    pub client: ClientSettings,
}

/// Missing file gives defaults. A file that cannot be read or parsed also
/// gives defaults, with a warning. Fields absent from the file take their
/// default values.
pub fn load_settings(path: &Path) -> Settings {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
        Err(e) => {
            warn!("cannot read {}: {}; using defaults", path.display(), e);
            return Settings::default();
        }
    };
    match toml::from_str(&data) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot parse {}: {}; using defaults", path.display(), e);
            Settings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    let dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create config dir {}", dir.display()))?;
    let data = toml::to_string_pretty(settings).context("serialize settings")?;

    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("write {}", path.display()))?;
    info!("settings saved: {}", path.display());
    Ok(())
}
