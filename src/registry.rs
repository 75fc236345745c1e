//! Named backend configurations
//!
//! The registry file is XML:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <root>
//!   <remoteServer label="cluster" baseDirectory="/scratch/me" host="me@cluster"/>
//!   <remoteServer label="burst" baseDirectory="/scratch" launchScript="/opt/alloc.sh"/>
//!   <remoteServer label="wsl" type="WSLLinux" baseDirectory="/home/me/runs" WSLExecutable="ubuntu.exe"/>
//!   <preferredServer label="cluster"/>
//! </root>
//! ```
//!
//! A registry is an explicit value: load it once at startup and pass it to
//! whatever needs to resolve labels.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::errors::{OffloadError, Result};
use crate::server::{RemoteServer, SshServer, WslServer};
use crate::xml;

const TYPE_SSH: &str = "SSHLinux";
const TYPE_WSL: &str = "WSLLinux";

/// How a backend is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerKind {
    /// Always-on SSH host
    Ssh { host: String },
    /// SSH host allocated by a launch script
    OnDemandSsh { launch_script: PathBuf },
    /// WSL distribution
    Wsl { executable: PathBuf },
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::Ssh { host } => write!(f, "ssh {host}"),
            ServerKind::OnDemandSsh { launch_script } => {
                write!(f, "ssh (on demand via {})", launch_script.display())
            }
            ServerKind::Wsl { executable } => write!(f, "wsl {}", executable.display()),
        }
    }
}

/// One registry entry. Immutable after load apart from the cached live
/// backend.
#[derive(Debug)]
pub struct ServerConfig {
    label: String,
    base_directory: PathBuf,
    kind: ServerKind,
    live: Mutex<Option<Weak<dyn RemoteServer>>>,
}

impl ServerConfig {
    pub fn new(label: impl Into<String>, base_directory: impl Into<PathBuf>, kind: ServerKind) -> Self {
        Self {
            label: label.into(),
            base_directory: base_directory.into(),
            kind,
            live: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    pub fn kind(&self) -> &ServerKind {
        &self.kind
    }

    /// True iff the backend is allocated by a launch script
    pub fn is_on_demand(&self) -> bool {
        matches!(self.kind, ServerKind::OnDemandSsh { .. })
    }

    fn cached(&self) -> Option<Arc<dyn RemoteServer>> {
        self.live.lock().ok()?.as_ref()?.upgrade()
    }

    /// Make `server` the shared live backend of this configuration
    pub fn attach_instance(&self, server: &Arc<dyn RemoteServer>) {
        if let Ok(mut live) = self.live.lock() {
            *live = Some(Arc::downgrade(server));
        }
    }

    fn create_backend(&self) -> Arc<dyn RemoteServer> {
        match &self.kind {
            ServerKind::Ssh { host } => {
                Arc::new(SshServer::new(&self.label, &self.base_directory, host))
            }
            ServerKind::OnDemandSsh { launch_script } => Arc::new(SshServer::on_demand(
                &self.label,
                &self.base_directory,
                launch_script,
            )),
            ServerKind::Wsl { executable } => {
                Arc::new(WslServer::new(&self.label, &self.base_directory, executable))
            }
        }
    }

    /// Shared live backend, created and launched on first use.
    ///
    /// Only a weak reference is cached, so the backend lives as long as its
    /// longest holder.
    pub fn instance(&self) -> Result<Arc<dyn RemoteServer>> {
        let server = match self.cached() {
            Some(server) => server,
            None => {
                let server = self.create_backend();
                self.attach_instance(&server);
                server
            }
        };
        if !server.check_if_running() {
            tracing::info!(server = %self.label, kind = %self.kind, "Launching remote server");
            server.launch()?;
        }
        Ok(server)
    }

    /// Live backend if it is already up.
    ///
    /// Always-on backends are probed and adopted when reachable; on-demand
    /// backends are never launched from here.
    pub fn instance_if_running(&self) -> Option<Arc<dyn RemoteServer>> {
        if let Some(server) = self.cached() {
            return server.check_if_running().then_some(server);
        }
        if self.is_on_demand() {
            return None;
        }

        let server = self.create_backend();
        if !server.host_is_available() {
            tracing::debug!(server = %self.label, "Remote server not reachable");
            return None;
        }
        server.launch().ok()?;
        self.attach_instance(&server);
        Some(server)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "root")]
struct RegistryDocument {
    #[serde(rename = "remoteServer", default)]
    servers: Vec<ServerEntry>,
    #[serde(rename = "preferredServer", default, skip_serializing_if = "Option::is_none")]
    preferred: Option<PreferredEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerEntry {
    #[serde(rename = "@label", default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(rename = "@baseDirectory", default, skip_serializing_if = "Option::is_none")]
    base_directory: Option<String>,
    #[serde(rename = "@host", default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(rename = "@launchScript", default, skip_serializing_if = "Option::is_none")]
    launch_script: Option<String>,
    #[serde(rename = "@WSLExecutable", default, skip_serializing_if = "Option::is_none")]
    wsl_executable: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferredEntry {
    #[serde(rename = "@label")]
    label: String,
}

impl ServerEntry {
    fn into_config(self) -> Result<ServerConfig> {
        let label = self
            .label
            .filter(|l| !l.is_empty())
            .ok_or_else(|| OffloadError::config("remoteServer entry without label"))?;
        let base_directory = self.base_directory.ok_or_else(|| {
            OffloadError::config(format!("remoteServer \"{label}\" has no baseDirectory"))
        })?;

        let kind = match self.kind.as_deref().unwrap_or(TYPE_SSH) {
            TYPE_SSH => match (self.host, self.launch_script) {
                (Some(host), None) => ServerKind::Ssh { host },
                (None, Some(script)) => ServerKind::OnDemandSsh {
                    launch_script: PathBuf::from(script),
                },
                (Some(_), Some(_)) => {
                    return Err(OffloadError::config(format!(
                        "remoteServer \"{label}\": host and launchScript are mutually exclusive"
                    )))
                }
                (None, None) => {
                    return Err(OffloadError::config(format!(
                        "remoteServer \"{label}\": either host or launchScript is required"
                    )))
                }
            },
            TYPE_WSL => ServerKind::Wsl {
                executable: self.wsl_executable.map(PathBuf::from).ok_or_else(|| {
                    OffloadError::config(format!(
                        "remoteServer \"{label}\": WSLExecutable is required"
                    ))
                })?,
            },
            other => {
                return Err(OffloadError::config(format!(
                    "remoteServer \"{label}\": unknown type \"{other}\""
                )))
            }
        };

        Ok(ServerConfig::new(label, base_directory, kind))
    }

    fn from_config(config: &ServerConfig) -> Self {
        let mut entry = ServerEntry {
            label: Some(config.label.clone()),
            base_directory: Some(config.base_directory.to_string_lossy().into_owned()),
            ..Self::default()
        };
        match &config.kind {
            ServerKind::Ssh { host } => entry.host = Some(host.clone()),
            ServerKind::OnDemandSsh { launch_script } => {
                entry.launch_script = Some(launch_script.to_string_lossy().into_owned())
            }
            ServerKind::Wsl { executable } => {
                entry.kind = Some(TYPE_WSL.to_string());
                entry.wsl_executable = Some(executable.to_string_lossy().into_owned());
            }
        }
        entry
    }
}

/// Table of named backend configurations
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: Vec<Arc<ServerConfig>>,
    preferred: Option<String>,
}

impl ServerRegistry {
    /// Parse a registry document
    pub fn from_xml_str(content: &str) -> Result<Self> {
        let doc: RegistryDocument = quick_xml::de::from_str(content)?;
        let mut registry = Self::default();
        for entry in doc.servers {
            registry.insert(entry.into_config()?);
        }
        if let Some(preferred) = doc.preferred {
            registry.set_preferred_server(Some(&preferred.label))?;
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OffloadError::config(format!("cannot read server registry {}: {e}", path.display()))
        })?;
        let registry = Self::from_xml_str(&content)?;
        tracing::info!(path = %path.display(), servers = registry.len(), "Loaded server registry");
        Ok(registry)
    }

    /// Merge several registry files; later files replace same-label entries
    /// from earlier ones. Missing files are skipped.
    pub fn load_layered(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = Self::default();
        for path in paths {
            if !path.exists() {
                tracing::debug!(path = %path.display(), "Server registry not present");
                continue;
            }
            let layer = Self::load(path)?;
            for server in layer.servers {
                merged.insert_shared(server);
            }
            if layer.preferred.is_some() {
                merged.preferred = layer.preferred;
            }
        }
        Ok(merged)
    }

    /// Add or replace the entry with the same label
    pub fn insert(&mut self, config: ServerConfig) -> Arc<ServerConfig> {
        let config = Arc::new(config);
        self.insert_shared(config.clone());
        config
    }

    fn insert_shared(&mut self, config: Arc<ServerConfig>) {
        match self.servers.iter_mut().find(|s| s.label == config.label) {
            Some(existing) => *existing = config,
            None => self.servers.push(config),
        }
    }

    pub fn find_server(&self, label: &str) -> Result<Arc<ServerConfig>> {
        self.servers
            .iter()
            .find(|s| s.label == label)
            .cloned()
            .ok_or_else(|| OffloadError::config(format!("unknown remote server \"{label}\"")))
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<ServerConfig>> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn preferred_server(&self) -> Option<Arc<ServerConfig>> {
        self.preferred
            .as_deref()
            .and_then(|label| self.find_server(label).ok())
    }

    pub fn set_preferred_server(&mut self, label: Option<&str>) -> Result<()> {
        if let Some(label) = label {
            self.find_server(label)?;
        }
        self.preferred = label.map(str::to_string);
        Ok(())
    }

    pub fn to_xml_string(&self) -> Result<String> {
        let doc = RegistryDocument {
            servers: self.servers.iter().map(|s| ServerEntry::from_config(s)).collect(),
            preferred: self.preferred.clone().map(|label| PreferredEntry { label }),
        };
        xml::to_document(&doc)
    }

    pub fn write_configuration(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_xml_string()?)?;
        tracing::info!(path = %path.display(), "Wrote server registry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::fake::FakeServer;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<root>
  <remoteServer label="cluster" baseDirectory="/scratch/me" host="me@cluster"/>
  <remoteServer label="burst" baseDirectory="/scratch" launchScript="/opt/alloc.sh"/>
  <remoteServer label="wsl" type="WSLLinux" baseDirectory="/home/me/runs" WSLExecutable="ubuntu.exe"/>
  <preferredServer label="burst"/>
</root>
"#;

    #[test]
    fn test_parse_sample() {
        let registry = ServerRegistry::from_xml_str(SAMPLE).unwrap();
        assert_eq!(registry.len(), 3);

        let cluster = registry.find_server("cluster").unwrap();
        assert!(!cluster.is_on_demand());
        assert_eq!(cluster.base_directory(), Path::new("/scratch/me"));
        assert_eq!(
            cluster.kind(),
            &ServerKind::Ssh {
                host: "me@cluster".to_string()
            }
        );

        assert!(registry.find_server("burst").unwrap().is_on_demand());
        assert!(matches!(
            registry.find_server("wsl").unwrap().kind(),
            ServerKind::Wsl { .. }
        ));
        assert_eq!(registry.preferred_server().unwrap().label(), "burst");
    }

    #[test]
    fn test_host_and_launch_script_both_present() {
        let xml = r#"<root><remoteServer label="x" baseDirectory="/d" host="h" launchScript="s"/></root>"#;
        let err = ServerRegistry::from_xml_str(xml).unwrap_err();
        assert!(matches!(err, OffloadError::Configuration(_)));
    }

    #[test]
    fn test_host_and_launch_script_both_missing() {
        let xml = r#"<root><remoteServer label="x" baseDirectory="/d"/></root>"#;
        let err = ServerRegistry::from_xml_str(xml).unwrap_err();
        assert!(matches!(err, OffloadError::Configuration(_)));
    }

    #[test]
    fn test_missing_base_directory_and_unknown_type() {
        let xml = r#"<root><remoteServer label="x" host="h"/></root>"#;
        assert!(ServerRegistry::from_xml_str(xml).is_err());

        let xml = r#"<root><remoteServer label="x" type="Cloud" baseDirectory="/d" host="h"/></root>"#;
        assert!(ServerRegistry::from_xml_str(xml).is_err());
    }

    #[test]
    fn test_unknown_label() {
        let registry = ServerRegistry::from_xml_str(SAMPLE).unwrap();
        assert!(matches!(
            registry.find_server("nope"),
            Err(OffloadError::Configuration(_))
        ));
        let mut registry = registry;
        assert!(registry.set_preferred_server(Some("nope")).is_err());
    }

    #[test]
    fn test_empty_registry() {
        let registry = ServerRegistry::from_xml_str("<root/>").unwrap();
        assert!(registry.is_empty());
        assert!(registry.preferred_server().is_none());
    }

    #[test]
    fn test_write_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sub").join("remoteservers.list");

        let registry = ServerRegistry::from_xml_str(SAMPLE).unwrap();
        registry.write_configuration(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("<?xml"));

        let reloaded = ServerRegistry::load(&path).unwrap();
        assert_eq!(reloaded.len(), 3);
        for original in registry.servers() {
            let copy = reloaded.find_server(original.label()).unwrap();
            assert_eq!(copy.kind(), original.kind());
            assert_eq!(copy.base_directory(), original.base_directory());
        }
        assert_eq!(reloaded.preferred_server().unwrap().label(), "burst");
    }

    #[test]
    fn test_layered_later_file_wins() {
        let tmp = TempDir::new().unwrap();
        let global = tmp.path().join("global.list");
        let user = tmp.path().join("user.list");
        std::fs::write(&global, SAMPLE).unwrap();
        std::fs::write(
            &user,
            r#"<root><remoteServer label="cluster" baseDirectory="/home/me" host="other"/></root>"#,
        )
        .unwrap();

        let registry = ServerRegistry::load_layered(&[
            global,
            tmp.path().join("missing.list"),
            user,
        ])
        .unwrap();
        assert_eq!(registry.len(), 3);
        let cluster = registry.find_server("cluster").unwrap();
        assert_eq!(cluster.base_directory(), Path::new("/home/me"));
        assert_eq!(registry.preferred_server().unwrap().label(), "burst");
    }

    #[test]
    fn test_attached_instance_is_shared() {
        let config = ServerConfig::new("fake", "/base", ServerKind::Ssh { host: "h".into() });
        let server: Arc<dyn RemoteServer> = Arc::new(FakeServer::running("fake", "/base"));
        config.attach_instance(&server);

        let a = config.instance().unwrap();
        let b = config.instance_if_running().unwrap();
        assert!(Arc::ptr_eq(&a, &server));
        assert!(Arc::ptr_eq(&b, &server));
    }

    #[test]
    fn test_instance_if_running_never_launches_on_demand() {
        let config = ServerConfig::new(
            "burst",
            "/scratch",
            ServerKind::OnDemandSsh {
                launch_script: PathBuf::from("/nonexistent/alloc.sh"),
            },
        );
        assert!(config.instance_if_running().is_none());
    }

    #[test]
    fn test_stopped_cached_instance_is_not_running() {
        let config = ServerConfig::new("fake", "/base", ServerKind::Ssh { host: "h".into() });
        let server: Arc<dyn RemoteServer> = Arc::new(FakeServer::new("fake", "/base"));
        config.attach_instance(&server);
        assert!(config.instance_if_running().is_none());
    }
}
