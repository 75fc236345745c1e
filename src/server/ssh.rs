//! Linux hosts reached over SSH
//!
//! Two flavours share this type:
//! - always-on hosts named directly in the registry
//! - on-demand hosts allocated by a launch script (`<script> launch` prints
//!   the host name, `<script> dispose <host>` releases it)

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use super::rsync::{self, Direction};
use super::{find_free_local_port, run_captured, shell_quote, PortMapping, Progress, RemoteServer};
use crate::errors::{OffloadError, Result};

#[derive(Debug, Clone)]
enum HostSource {
    /// Fixed host given in the registry
    Static,
    LaunchScript(PathBuf),
}

/// A Linux host driven through the `ssh` and `rsync` CLIs
#[derive(Debug)]
pub struct SshServer {
    label: String,
    base_directory: PathBuf,
    source: HostSource,
    host: Mutex<Option<String>>,
    running: AtomicBool,
    bandwidth_limit: AtomicU32,
}

impl SshServer {
    /// Always-on host
    pub fn new(label: impl Into<String>, base_directory: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            base_directory: base_directory.into(),
            source: HostSource::Static,
            host: Mutex::new(Some(host.into())),
            running: AtomicBool::new(false),
            bandwidth_limit: AtomicU32::new(0),
        }
    }

    /// Host allocated by `launch_script` when launched
    pub fn on_demand(
        label: impl Into<String>,
        base_directory: impl Into<PathBuf>,
        launch_script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label: label.into(),
            base_directory: base_directory.into(),
            source: HostSource::LaunchScript(launch_script.into()),
            host: Mutex::new(None),
            running: AtomicBool::new(false),
            bandwidth_limit: AtomicU32::new(0),
        }
    }

    pub fn is_on_demand(&self) -> bool {
        matches!(self.source, HostSource::LaunchScript(_))
    }

    /// Current host name, if known (on-demand hosts only after launch)
    pub fn host(&self) -> Option<String> {
        self.host.lock().ok().and_then(|h| h.clone())
    }

    fn require_host(&self) -> Result<String> {
        self.host().ok_or_else(|| {
            OffloadError::lifecycle(format!("remote server \"{}\" has no host yet", self.label))
        })
    }

    fn set_host(&self, host: Option<String>) {
        if let Ok(mut guard) = self.host.lock() {
            *guard = host;
        }
    }

    /// The script entry is a shell command line, so it may carry its own
    /// interpreter or arguments.
    fn run_launch_script(script: &Path, args: &str) -> Result<String> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &format!("{} {args}", script.display())]);
        run_captured(cmd, &format!("{} {args}", script.display()))
    }

    fn rsync(&self, direction: Direction, src: String, dst: String, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        let mut cmd = Command::new("rsync");
        cmd.args(rsync::options(direction, exclude, self.transfer_bandwidth_limit()))
            .arg(src)
            .arg(dst);
        rsync::run(cmd, progress)
    }

    /// Ask the remote side for a currently unused TCP port
    fn find_free_remote_port(&self) -> Result<u16> {
        let out = self.capture_output(
            "python3 -c 'import socket; s=socket.socket(); s.bind((\"\", 0)); print(s.getsockname()[1])'",
        )?;
        out.trim()
            .parse()
            .map_err(|_| OffloadError::lifecycle(format!("invalid remote port \"{}\"", out.trim())))
    }
}

impl RemoteServer for SshServer {
    fn label(&self) -> &str {
        &self.label
    }

    fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    fn host_is_available(&self) -> bool {
        let Some(host) = self.host() else {
            return false;
        };
        Command::new("ssh")
            .args(["-q", "-o", "BatchMode=yes", &host, "exit"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn check_if_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn launch(&self) -> Result<()> {
        if let HostSource::LaunchScript(script) = &self.source {
            if self.check_if_running() {
                return Ok(());
            }
            let out = Self::run_launch_script(script, "launch").map_err(|e| {
                OffloadError::lifecycle(format!("launching \"{}\" failed: {e}", self.label))
            })?;
            let host = out
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .ok_or_else(|| {
                    OffloadError::lifecycle(format!(
                        "launch script of \"{}\" printed no host name",
                        self.label
                    ))
                })?
                .to_string();
            tracing::info!(server = %self.label, host = %host, "Launched on-demand server");
            self.set_host(Some(host));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let HostSource::LaunchScript(script) = &self.source {
            if let Some(host) = self.host() {
                Self::run_launch_script(script, &format!("dispose {}", shell_quote(&host)))
                    .map_err(|e| {
                        OffloadError::lifecycle(format!("disposing \"{host}\" failed: {e}"))
                    })?;
                tracing::info!(server = %self.label, host = %host, "Disposed on-demand server");
            }
            self.set_host(None);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn remote_command(&self, command: &str) -> Result<Command> {
        let host = self.require_host()?;
        let mut cmd = Command::new("ssh");
        cmd.args(["-q", &host, &format!("bash -lc {}", shell_quote(command))]);
        Ok(cmd)
    }

    fn set_transfer_bandwidth_limit(&self, kbps: u32) {
        self.bandwidth_limit.store(kbps, Ordering::SeqCst);
    }

    fn transfer_bandwidth_limit(&self) -> u32 {
        self.bandwidth_limit.load(Ordering::SeqCst)
    }

    fn put_file(&self, local: &Path, remote: &Path, progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        let host = self.require_host()?;
        self.rsync(
            Direction::Upload,
            local.to_string_lossy().into_owned(),
            format!("{host}:{}", remote.display()),
            &[],
            progress,
        )
    }

    fn sync_to_remote(&self, local_dir: &Path, remote_dir: &Path, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        let host = self.require_host()?;
        tracing::info!(server = %self.label, local = %local_dir.display(), remote = %remote_dir.display(), "Syncing to remote");
        self.rsync(
            Direction::Upload,
            format!("{}/", local_dir.display()),
            format!("{host}:{}", remote_dir.display()),
            exclude,
            progress,
        )
    }

    fn sync_to_local(&self, local_dir: &Path, remote_dir: &Path, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        let host = self.require_host()?;
        tracing::info!(server = %self.label, local = %local_dir.display(), remote = %remote_dir.display(), "Syncing to local");
        self.rsync(
            Direction::Download,
            format!("{host}:{}/", remote_dir.display()),
            local_dir.to_string_lossy().into_owned(),
            exclude,
            progress,
        )
    }

    fn ssh_target(&self) -> Option<String> {
        self.host()
    }

    /// Forward every remote listener to a fresh local port and every local
    /// listener to a fresh remote port through one `ssh -N` tunnel.
    fn make_ports_accessible(
        &self,
        remote_listener_ports: &BTreeSet<u16>,
        local_listener_ports: &BTreeSet<u16>,
    ) -> Result<PortMapping> {
        self.assert_running()?;
        let host = self.require_host()?;
        let mut cmd = Command::new("ssh");
        cmd.arg("-N");

        let mut remote_to_local = BTreeMap::new();
        for &remote in remote_listener_ports {
            let local = find_free_local_port()?;
            cmd.args(["-L", &format!("{local}:127.0.0.1:{remote}")]);
            remote_to_local.insert(remote, local);
        }

        let mut local_to_remote = BTreeMap::new();
        for &local in local_listener_ports {
            let remote = self.find_free_remote_port()?;
            cmd.args(["-R", &format!("{remote}:127.0.0.1:{local}")]);
            local_to_remote.insert(local, remote);
        }

        cmd.arg(&host);
        let tunnel = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| OffloadError::spawn("ssh", e))?;
        tracing::info!(server = %self.label, ?remote_to_local, ?local_to_remote, "Opened port tunnel");

        Ok(PortMapping::tunneled(remote_to_local, local_to_remote, tunnel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_remote_command_wraps_login_shell() {
        let server = SshServer::new("cluster", "/scratch", "user@cluster");
        let cmd = server.remote_command("echo 'a b'").unwrap();
        assert_eq!(cmd.get_program(), "ssh");
        assert_eq!(
            args_of(&cmd),
            vec!["-q", "user@cluster", r#"bash -lc 'echo '\''a b'\'''"#]
        );
    }

    #[test]
    fn test_static_launch_flips_flag() {
        let server = SshServer::new("cluster", "/scratch", "cluster");
        assert!(!server.is_on_demand());
        assert!(!server.check_if_running());
        server.launch().unwrap();
        assert!(server.check_if_running());
        server.stop().unwrap();
        assert!(!server.check_if_running());
        // The static host survives a stop
        assert_eq!(server.host().as_deref(), Some("cluster"));
    }

    #[test]
    fn test_on_demand_launch_reads_host_and_disposes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("alloc.sh");
        let log = tmp.path().join("log");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = launch ]; then echo node42; echo extra; else echo \"$@\" >> '{}'; fi\n",
                log.display()
            ),
        )
        .unwrap();
        let launcher = format!("sh '{}'", script.display());

        let server = SshServer::on_demand("burst", "/scratch", &launcher);
        assert!(server.is_on_demand());
        assert!(server.remote_command("true").is_err());

        server.launch().unwrap();
        assert!(server.check_if_running());
        assert_eq!(server.host().as_deref(), Some("node42"));
        assert_eq!(server.ssh_target().as_deref(), Some("node42"));

        server.stop().unwrap();
        assert!(!server.check_if_running());
        assert_eq!(server.host(), None);
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "dispose node42");
    }

    #[test]
    fn test_failing_launch_script() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("alloc.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();

        let server = SshServer::on_demand("burst", "/scratch", format!("sh '{}'", script.display()));
        let err = server.launch().unwrap_err();
        assert!(matches!(err, OffloadError::ResourceLifecycle(_)));
        assert!(!server.check_if_running());
    }

    #[test]
    fn test_operations_require_running() {
        let server = SshServer::new("cluster", "/scratch", "cluster");
        assert!(server.execute_command("true", false).is_err());
        assert!(server
            .sync_to_remote(Path::new("/tmp"), Path::new("/scratch/x"), &[], None)
            .is_err());
    }

    #[test]
    fn test_bandwidth_limit() {
        let server = SshServer::new("cluster", "/scratch", "cluster");
        assert_eq!(server.transfer_bandwidth_limit(), 0);
        server.set_transfer_bandwidth_limit(800);
        assert_eq!(server.transfer_bandwidth_limit(), 800);
    }
}
