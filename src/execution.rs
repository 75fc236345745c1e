//! Durable pairing of a local case directory with a remote location
//!
//! The location file inside the local directory is both the persisted
//! binding and the marker that the directory is remote-execution-enabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::errors::Result;
use crate::location::RemoteLocation;
use crate::registry::{ServerConfig, ServerRegistry};
use crate::server::Progress;

/// File name used when none is given
pub const DEFAULT_CONFIG_FILE_NAME: &str = "meta.foam";

#[derive(Debug)]
pub struct RemoteExecutionConfig {
    location: RemoteLocation,
    local_dir: PathBuf,
    config_file: PathBuf,
}

impl RemoteExecutionConfig {
    pub fn default_config_file(local_dir: &Path) -> PathBuf {
        local_dir.join(DEFAULT_CONFIG_FILE_NAME)
    }

    /// Whether `local_dir` carries a location file
    pub fn is_remote_execution_enabled(local_dir: &Path) -> bool {
        Self::default_config_file(local_dir).is_file()
    }

    fn config_path(local_dir: &Path, config_file: Option<PathBuf>) -> PathBuf {
        match config_file {
            Some(file) if file.is_absolute() => file,
            Some(file) => local_dir.join(file),
            None => Self::default_config_file(local_dir),
        }
    }

    /// Bind an initialized location to `local_dir`, writing the file now
    pub fn new(
        location: RemoteLocation,
        local_dir: impl Into<PathBuf>,
        config_file: Option<PathBuf>,
    ) -> Result<Self> {
        let local_dir = local_dir.into();
        let config_file = Self::config_path(&local_dir, config_file);
        location.write_config_file(&config_file)?;
        Ok(Self {
            location,
            local_dir,
            config_file,
        })
    }

    /// Restore the binding stored in `local_dir`
    pub fn open(
        registry: &ServerRegistry,
        local_dir: impl Into<PathBuf>,
        config_file: Option<PathBuf>,
    ) -> Result<Self> {
        let local_dir = local_dir.into();
        let config_file = Self::config_path(&local_dir, config_file);
        let location = RemoteLocation::from_config_file(registry, &config_file)?;
        Ok(Self {
            location,
            local_dir,
            config_file,
        })
    }

    /// Allocate a new location on `server_config` and bind it.
    ///
    /// `remote_path` may be relative to the server's base directory; without
    /// one a temporary directory is created.
    pub fn allocate(
        server_config: Arc<ServerConfig>,
        local_dir: impl Into<PathBuf>,
        remote_path: Option<PathBuf>,
        config_file: Option<PathBuf>,
    ) -> Result<Self> {
        let mut location = RemoteLocation::new(server_config, remote_path);
        location.initialize()?;
        location.assert_active()?;
        let config = Self::new(location, local_dir, config_file)?;
        info!(
            server = %config.location.server_label(),
            local = %config.local_dir.display(),
            "Bound local directory to remote location"
        );
        Ok(config)
    }

    pub fn location(&self) -> &RemoteLocation {
        &self.location
    }

    pub fn location_mut(&mut self) -> &mut RemoteLocation {
        &mut self.location
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.local_dir.join(path)
        }
    }

    /// Copy one file; relative `local` paths are taken in the local directory
    pub fn put_file(&self, local: &Path, remote: &Path, progress: Progress<'_>) -> Result<()> {
        self.location.put_file(&self.resolve(local), remote, progress)
    }

    pub fn sync_to_remote(&self, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        self.location.sync_to_remote(&self.local_dir, exclude, progress)
    }

    pub fn sync_to_local(&self, skip_time_steps: bool, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        self.location
            .sync_to_local(&self.local_dir, skip_time_steps, exclude, progress)
    }

    /// Remote cleanup, then remove the location file
    pub fn cleanup(&mut self, force_removal: bool) -> Result<()> {
        self.location.cleanup(force_removal)?;
        std::fs::remove_file(&self.config_file)?;
        info!(path = %self.config_file.display(), "Removed remote location file");
        Ok(())
    }
}
