//! A working directory on a remote backend
//!
//! A location moves through an explicit state machine:
//! `Unvalidated -> {Active, Inactive}`, with [`RemoteLocation::validate`] as
//! the only transition function besides `initialize`/`cleanup`. Every
//! remote operation checks for `Active` before touching the network.
//!
//! The location file is a single XML element:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <remote server="cluster" directory="/scratch/me/ir4f2a9c" temporary="yes" autocreate="yes"/>
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::QUEUE_SOCKET_NAME;
use crate::errors::{OffloadError, Result};
use crate::queue::CommandQueueClient;
use crate::registry::{ServerConfig, ServerRegistry};
use crate::server::{quote_path, Progress, RemoteServer};
use crate::xml;

const LOCATION_ROOT: &str = "remote";
const DEFAULT_TEMP_TEMPLATE: &str = "irXXXXXX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationState {
    Unvalidated,
    Active,
    Inactive,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "remote")]
struct LocationDocument {
    #[serde(rename = "@server", default)]
    server: Option<String>,
    #[serde(rename = "@directory", default)]
    directory: Option<String>,
    #[serde(rename = "@temporary", default, skip_serializing_if = "Option::is_none")]
    temporary: Option<String>,
    #[serde(rename = "@autocreate", default, skip_serializing_if = "Option::is_none")]
    autocreate: Option<String>,
}

/// Names in `entries` that look like simulation time steps (plain numbers)
pub fn time_step_names(entries: &[PathBuf]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| e.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| n.parse::<f64>().is_ok_and(f64::is_finite))
        .collect()
}

fn read_flag(doc_value: Option<&str>, name: &str, path: &Path) -> bool {
    match doc_value.map(xml::parse_flag) {
        Some(Some(v)) => v,
        Some(None) => {
            warn!(path = %path.display(), attribute = name, "Unrecognized flag value, assuming no");
            false
        }
        None => {
            warn!(path = %path.display(), attribute = name, "Attribute missing, assuming no");
            false
        }
    }
}

/// A directory on a backend, bound to a server configuration
#[derive(Debug)]
pub struct RemoteLocation {
    server_config: Arc<ServerConfig>,
    server: Option<Arc<dyn RemoteServer>>,
    remote_dir: Option<PathBuf>,
    auto_create_remote_dir: bool,
    is_temporary_storage: bool,
    temp_dir_template: String,
    environment_preamble: Option<String>,
    queue_program: Option<String>,
    // Created on first queue use; the daemon outlives this value
    queue: OnceCell<Mutex<CommandQueueClient>>,
    state: LocationState,
}

impl RemoteLocation {
    /// Unvalidated location. Without a directory, `initialize` allocates a
    /// temporary one.
    pub fn new(server_config: Arc<ServerConfig>, remote_dir: Option<PathBuf>) -> Self {
        let temporary = remote_dir.is_none();
        Self {
            server_config,
            server: None,
            remote_dir,
            auto_create_remote_dir: temporary,
            is_temporary_storage: temporary,
            temp_dir_template: DEFAULT_TEMP_TEMPLATE.to_string(),
            environment_preamble: None,
            queue_program: None,
            queue: OnceCell::new(),
            state: LocationState::Unvalidated,
        }
    }

    /// Unvalidated location on an already live backend
    pub fn with_server(
        server_config: Arc<ServerConfig>,
        server: Arc<dyn RemoteServer>,
        remote_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            server: Some(server),
            ..Self::new(server_config, remote_dir)
        }
    }

    /// Restore a location from its file. The backend must already be
    /// reachable and the directory present.
    pub fn from_config_file(registry: &ServerRegistry, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OffloadError::config(format!("cannot read location file {}: {e}", path.display()))
        })?;

        match xml::root_element_name(&content) {
            Some(root) if root == LOCATION_ROOT => {}
            Some(root) => {
                return Err(OffloadError::config(format!(
                    "{}: expected <{LOCATION_ROOT}> element, found <{root}>",
                    path.display()
                )))
            }
            None => {
                return Err(OffloadError::config(format!(
                    "{}: no XML element found",
                    path.display()
                )))
            }
        }

        let doc: LocationDocument = quick_xml::de::from_str(&content)?;
        let label = doc.server.as_deref().ok_or_else(|| {
            OffloadError::config(format!("{}: missing server attribute", path.display()))
        })?;
        let directory = doc.directory.as_deref().ok_or_else(|| {
            OffloadError::config(format!("{}: missing directory attribute", path.display()))
        })?;

        let server_config = registry.find_server(label)?;
        let server = server_config.instance_if_running();

        let mut location = Self::new(server_config, Some(PathBuf::from(directory)));
        location.server = server;
        location.is_temporary_storage = read_flag(doc.temporary.as_deref(), "temporary", path);
        location.auto_create_remote_dir = read_flag(doc.autocreate.as_deref(), "autocreate", path);

        if location.validate() != LocationState::Active {
            return Err(OffloadError::NotActive {
                directory: location.remote_dir.clone(),
            });
        }
        info!(server = %label, dir = %directory, "Restored remote location");
        Ok(location)
    }

    pub fn set_temp_dir_template(&mut self, template: impl Into<String>) {
        self.temp_dir_template = template.into();
    }

    /// Shell text run before every command (e.g. sourcing a runtime env)
    pub fn set_environment_preamble(&mut self, preamble: Option<String>) {
        self.environment_preamble = preamble.filter(|p| !p.trim().is_empty());
        self.queue.take();
    }

    pub fn set_queue_program(&mut self, program: impl Into<String>) {
        self.queue_program = Some(program.into());
        self.queue.take();
    }

    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.server_config
    }

    pub fn server(&self) -> Option<&Arc<dyn RemoteServer>> {
        self.server.as_ref()
    }

    pub fn server_label(&self) -> &str {
        self.server_config.label()
    }

    pub fn remote_dir(&self) -> Option<&Path> {
        self.remote_dir.as_deref()
    }

    pub fn is_temporary_storage(&self) -> bool {
        self.is_temporary_storage
    }

    pub fn state(&self) -> LocationState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LocationState::Active
    }

    fn absolute(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.server_config.base_directory().join(dir)
        }
    }

    /// Acquire the backend and make sure the directory exists, then validate
    pub fn initialize(&mut self) -> Result<LocationState> {
        let server = match &self.server {
            Some(server) => server.clone(),
            None => {
                let server = self.server_config.instance()?;
                self.server = Some(server.clone());
                server
            }
        };
        if !server.check_if_running() {
            server.launch()?;
        }

        let dir = match self.remote_dir.clone() {
            None => {
                let template = self.server_config.base_directory().join(&self.temp_dir_template);
                let dir = server.create_temporary_directory(&template)?;
                info!(server = %self.server_label(), dir = %dir.display(), "Allocated temporary remote directory");
                dir
            }
            Some(dir) => {
                let dir = self.absolute(&dir);
                if !server.check_if_directory_exists(&dir)? {
                    server.create_directory(&dir)?;
                    info!(server = %self.server_label(), dir = %dir.display(), "Created remote directory");
                }
                dir
            }
        };
        self.remote_dir = Some(dir);
        Ok(self.validate())
    }

    /// Recompute the state: Active iff the backend is present and running
    /// and the directory exists. Never fails.
    pub fn validate(&mut self) -> LocationState {
        let active = match (&self.server, &self.remote_dir) {
            (Some(server), Some(dir)) => {
                server.check_if_running() && server.check_if_directory_exists(dir).unwrap_or(false)
            }
            _ => false,
        };
        self.state = if active {
            LocationState::Active
        } else {
            LocationState::Inactive
        };
        self.state
    }

    /// Whether the directory currently exists; false when not reachable
    pub fn remote_dir_exists(&self) -> bool {
        match (&self.server, &self.remote_dir) {
            (Some(server), Some(dir)) if server.check_if_running() => {
                server.check_if_directory_exists(dir).unwrap_or(false)
            }
            _ => false,
        }
    }

    fn active(&self) -> Result<(&Arc<dyn RemoteServer>, &Path)> {
        match (self.state, &self.server, &self.remote_dir) {
            (LocationState::Active, Some(server), Some(dir)) => Ok((server, dir)),
            _ => Err(OffloadError::NotActive {
                directory: self.remote_dir.clone(),
            }),
        }
    }

    pub fn assert_active(&self) -> Result<()> {
        self.active().map(|_| ())
    }

    /// Queue daemon socket of this location
    pub fn socket(&self) -> Result<PathBuf> {
        let (_, dir) = self.active()?;
        Ok(dir.join(QUEUE_SOCKET_NAME))
    }

    /// Cancel queued work and, for temporary storage or when forced, delete
    /// the directory. Ends Inactive.
    pub fn cleanup(&mut self, force_removal: bool) -> Result<()> {
        let (server, dir) = self.active()?;
        let (server, dir) = (server.clone(), dir.to_path_buf());

        self.cancel_remote_commands()?;
        self.queue.take();
        if self.is_temporary_storage || force_removal {
            server.remove_directory(&dir)?;
            info!(server = %self.server_label(), dir = %dir.display(), "Removed remote directory");
        }
        self.state = LocationState::Inactive;
        Ok(())
    }

    /// Shell line for `command` inside this location
    fn command_line(&self, dir: &Path, command: &str) -> String {
        let mut line = format!(
            "export TS_SOCKET={}; ",
            quote_path(&dir.join(QUEUE_SOCKET_NAME))
        );
        if let Some(preamble) = &self.environment_preamble {
            let preamble = preamble.trim_end();
            line.push_str(preamble);
            if !preamble.ends_with(';') {
                line.push(';');
            }
            line.push(' ');
        }
        line.push_str(&format!("cd {} && ({command})", quote_path(dir)));
        line
    }

    /// Run `command` in the remote directory; returns the exit code
    pub fn exec_remote_cmd(&self, command: &str, throw_on_fail: bool) -> Result<i32> {
        let (server, dir) = self.active()?;
        server.execute_command(&self.command_line(dir, command), throw_on_fail)
    }

    /// Copy one file; a relative `remote` is taken inside the directory
    pub fn put_file(&self, local: &Path, remote: &Path, progress: Progress<'_>) -> Result<()> {
        let (server, dir) = self.active()?;
        server.put_file(local, &dir.join(remote), progress)
    }

    pub fn sync_to_remote(&self, local_dir: &Path, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        let (server, dir) = self.active()?;
        server.sync_to_remote(local_dir, dir, exclude, progress)
    }

    /// Pull the directory. With `skip_time_steps`, top-level entries named
    /// like numbers stay on the backend.
    pub fn sync_to_local(
        &self,
        local_dir: &Path,
        skip_time_steps: bool,
        exclude: &[String],
        progress: Progress<'_>,
    ) -> Result<()> {
        let (server, dir) = self.active()?;
        let mut exclude = exclude.to_vec();
        if skip_time_steps {
            let skipped = time_step_names(&self.remote_ls()?);
            info!(count = skipped.len(), "Skipping time step directories");
            exclude.extend(skipped);
        }
        server.sync_to_local(local_dir, dir, &exclude, progress)
    }

    pub fn remote_ls(&self) -> Result<Vec<PathBuf>> {
        let (server, dir) = self.active()?;
        server.list_remote_directory(dir)
    }

    pub fn remote_subdirs(&self) -> Result<Vec<PathBuf>> {
        let (server, dir) = self.active()?;
        server.list_remote_subdirectories(dir)
    }

    fn new_queue_client(&self) -> Result<CommandQueueClient> {
        let (server, dir) = self.active()?;
        let mut client = CommandQueueClient::remote(server.clone(), dir.join(QUEUE_SOCKET_NAME))
            .in_directory(dir)
            .keep_daemon();
        if let Some(preamble) = &self.environment_preamble {
            client = client.with_preamble(preamble.clone());
        }
        if let Some(program) = &self.queue_program {
            client = client.with_program(program.clone());
        }
        Ok(client)
    }

    /// Run `f` with this location's queue client.
    ///
    /// The client is shared by every queue operation of the location and
    /// never stops the daemon on its own; `cancel_remote_commands` and
    /// `cleanup` do.
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut CommandQueueClient) -> Result<R>) -> Result<R> {
        self.assert_active()?;
        let client = self
            .queue
            .get_or_try_init(|| self.new_queue_client().map(Mutex::new))?;
        let mut client = client
            .lock()
            .map_err(|_| OffloadError::lifecycle("queue client lock poisoned"))?;
        f(&mut client)
    }

    pub fn queue_remote_command(&self, command: &str, wait_for_previous_finished: bool) -> Result<()> {
        self.with_queue(|q| q.queue_command(command, wait_for_previous_finished))
    }

    pub fn wait_remote_queue_finished(&self) -> Result<()> {
        self.with_queue(|q| q.wait_queue_finished())
    }

    pub fn wait_last_command_finished(&self) -> Result<()> {
        self.with_queue(|q| q.wait_last_command_finished())
    }

    /// Cancel every queued job and stop the daemon
    pub fn cancel_remote_commands(&self) -> Result<()> {
        self.with_queue(|q| {
            q.cancel_all_jobs()?;
            q.stop_daemon()?;
            Ok(())
        })
    }

    /// Write the location file
    pub fn write_config_file(&self, path: &Path) -> Result<()> {
        let dir = self.remote_dir.as_ref().ok_or_else(|| {
            OffloadError::config("remote location has no directory yet; initialize it first")
        })?;
        let doc = LocationDocument {
            server: Some(self.server_label().to_string()),
            directory: Some(dir.to_string_lossy().into_owned()),
            temporary: Some(xml::format_flag(self.is_temporary_storage)),
            autocreate: Some(xml::format_flag(self.auto_create_remote_dir)),
        };
        std::fs::write(path, xml::to_document(&doc)?)?;
        info!(path = %path.display(), "Wrote remote location file");
        Ok(())
    }
}
