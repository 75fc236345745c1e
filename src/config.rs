use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the per-location queue daemon socket inside the remote directory
pub const QUEUE_SOCKET_NAME: &str = "tsp.socket";

/// System-wide registry, read before the per-user one
pub const GLOBAL_REGISTRY_PATH: &str = "/etc/simoffload/remoteservers.list";

/// Application configuration loaded from file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OffloadConfig {
    /// Server registry settings
    #[serde(default)]
    pub registry: RegistrySettings,

    /// File transfer settings
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Queue daemon settings
    #[serde(default)]
    pub queue: QueueSettings,

    /// Remote location settings
    #[serde(default)]
    pub location: LocationSettings,
}

/// Where the server registry lives
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistrySettings {
    /// Registry file path (None = `<config_dir>/simoffload/remoteservers.list`)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl RegistrySettings {
    /// Resolved registry file path
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| config_dir().join("remoteservers.list"))
    }

    /// Registry files to merge, lowest precedence first
    pub fn search_paths(&self) -> Vec<PathBuf> {
        match &self.path {
            Some(path) => vec![path.clone()],
            None => vec![PathBuf::from(GLOBAL_REGISTRY_PATH), self.resolved_path()],
        }
    }
}

/// rsync transfer settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferSettings {
    /// Bandwidth limit in kB/s (0 = unlimited)
    #[serde(default)]
    pub bandwidth_limit_kbps: u32,
}

/// Queue daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Queue daemon executable
    #[serde(default = "default_queue_program")]
    pub program: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            program: default_queue_program(),
        }
    }
}

fn default_queue_program() -> String {
    "tsp".to_string()
}

/// Remote location settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSettings {
    /// Name of the marker/config file inside a remote-enabled case directory
    #[serde(default = "default_config_file_name")]
    pub config_file_name: String,

    /// mktemp template for auto-created remote directories
    #[serde(default = "default_temp_dir_template")]
    pub temp_dir_template: String,

    /// Shell text run before every remote command (e.g. sourcing a solver environment)
    #[serde(default)]
    pub environment_preamble: Option<String>,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            config_file_name: default_config_file_name(),
            temp_dir_template: default_temp_dir_template(),
            environment_preamble: None,
        }
    }
}

fn default_config_file_name() -> String {
    "meta.foam".to_string()
}

fn default_temp_dir_template() -> String {
    "irXXXXXX".to_string()
}

/// Per-user configuration directory
fn config_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("~/.config/simoffload"),
        |dirs| dirs.config_dir().join("simoffload"),
    )
}

impl OffloadConfig {
    /// Load configuration from default path (~/.config/simoffload/config.toml)
    pub fn load() -> Self {
        Self::load_from_path(Self::default_path())
    }

    /// Get the default configuration path
    pub fn default_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Self {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Generate example configuration file content
    pub fn example() -> String {
        r#"# simoffload configuration
# Place this file at ~/.config/simoffload/config.toml

[registry]
# Server registry (XML list of <remoteServer> entries)
# path = "/etc/simoffload/remoteservers.list"

[transfer]
# rsync bandwidth limit in kB/s, 0 = unlimited
bandwidth_limit_kbps = 0

[queue]
# Queue daemon executable (task spooler)
program = "tsp"

[location]
# Marker file written into remote-enabled case directories
config_file_name = "meta.foam"

# mktemp template for auto-created remote directories
temp_dir_template = "irXXXXXX"

# Shell text run before every remote command
# environment_preamble = "source /opt/openfoam/etc/bashrc"
"#
        .to_string()
    }
}
