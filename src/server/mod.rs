//! Remote execution backends
//!
//! A backend is anything that can run a shell command line, hold a
//! directory tree, and move files to and from the local machine:
//! - [`SshServer`]: a Linux host reached over SSH, either always-on or
//!   allocated on demand by a launch script
//! - [`WslServer`]: a Linux distribution running under WSL
//!
//! Every backend is driven through the external CLIs it needs (`ssh`,
//! `rsync`, the WSL launcher) via `std::process::Command`. Directory
//! lifecycle helpers are shared default methods that issue plain POSIX
//! shell commands through [`RemoteServer::execute_command`].

mod rsync;
mod ssh;
mod wsl;

#[cfg(test)]
pub(crate) mod fake;

pub use ssh::SshServer;
pub use wsl::WslServer;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{OffloadError, Result};

/// Progress callback for transfers: percentage (0..=100) and a message
pub type Progress<'a> = Option<&'a mut dyn FnMut(u8, &str)>;

static BACKGROUND_PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"PID===([0-9]+)===PID").expect("valid regex"));

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Quote a path for a POSIX shell
pub fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Run a prepared command to completion, capturing stdout.
///
/// Nonzero exit becomes [`OffloadError::ExternalProcessFailed`] carrying
/// the captured stderr.
pub(crate) fn run_captured(mut cmd: Command, description: &str) -> Result<String> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| OffloadError::spawn(program, e))?;

    if !output.status.success() {
        return Err(OffloadError::ExternalProcessFailed {
            command: description.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A remote execution backend
pub trait RemoteServer: Send + Sync + fmt::Debug {
    /// Registry label of the server configuration this backend came from
    fn label(&self) -> &str;

    /// Base directory under which relative remote paths are resolved
    fn base_directory(&self) -> &Path;

    /// Probe whether the backend answers at all
    fn host_is_available(&self) -> bool;

    /// Whether the backend has been launched (and not stopped since)
    fn check_if_running(&self) -> bool;

    /// Bring the backend up
    fn launch(&self) -> Result<()>;

    /// Release the backend
    fn stop(&self) -> Result<()>;

    /// Build the local process that runs `command` in a login shell on the
    /// backend. Nothing is spawned.
    fn remote_command(&self, command: &str) -> Result<Command>;

    fn set_transfer_bandwidth_limit(&self, kbps: u32);

    /// Current rsync bandwidth limit in kB/s, 0 = unlimited
    fn transfer_bandwidth_limit(&self) -> u32;

    /// Copy a single local file to a remote path
    fn put_file(&self, local: &Path, remote: &Path, progress: Progress<'_>) -> Result<()>;

    /// Mirror `local_dir` into `remote_dir`, deleting extraneous remote files
    fn sync_to_remote(
        &self,
        local_dir: &Path,
        remote_dir: &Path,
        exclude: &[String],
        progress: Progress<'_>,
    ) -> Result<()>;

    /// Mirror `remote_dir` into `local_dir`, deleting extraneous local files
    /// that are not excluded
    fn sync_to_local(
        &self,
        local_dir: &Path,
        remote_dir: &Path,
        exclude: &[String],
        progress: Progress<'_>,
    ) -> Result<()>;

    /// `user@host` usable by sshfs, if the backend is reachable that way
    fn ssh_target(&self) -> Option<String> {
        None
    }

    fn assert_running(&self) -> Result<()> {
        if self.check_if_running() {
            Ok(())
        } else {
            Err(OffloadError::lifecycle(format!(
                "remote server \"{}\" is not running",
                self.label()
            )))
        }
    }

    /// Run `command` on the backend and wait for it.
    ///
    /// Standard output passes through. Returns the exit code; when
    /// `throw_on_fail` is set a nonzero exit is raised instead, with the
    /// captured stderr attached.
    fn execute_command(&self, command: &str, throw_on_fail: bool) -> Result<i32> {
        self.assert_running()?;
        let mut cmd = self.remote_command(command)?;
        let program = cmd.get_program().to_string_lossy().into_owned();
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| OffloadError::spawn(program, e))?;

        let code = output.status.code().unwrap_or(-1);
        if throw_on_fail && code != 0 {
            return Err(OffloadError::ExternalProcessFailed {
                command: command.to_string(),
                exit_code: code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(server = %self.label(), command = %command, code, "Remote command finished");
        Ok(code)
    }

    /// Run `command` on the backend, returning its standard output
    fn capture_output(&self, command: &str) -> Result<String> {
        self.assert_running()?;
        run_captured(self.remote_command(command)?, command)
    }

    /// Spawn `command` on the backend without waiting; stdout is piped
    fn launch_command(&self, command: &str) -> Result<Child> {
        self.assert_running()?;
        let mut cmd = self.remote_command(command)?;
        let program = cmd.get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| OffloadError::spawn(program, e))
    }

    /// Start `command` in the background on the backend
    fn launch_background_process(&self, command: &str) -> Result<BackgroundJob> {
        let mut child = self.launch_command(&format!("{command} & echo PID===$!===PID"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OffloadError::lifecycle("background launcher has no stdout"))?;

        for line in BufReader::new(stdout).lines() {
            let line = line?;
            if let Some(caps) = BACKGROUND_PID.captures(&line) {
                let pid: u32 = caps[1]
                    .parse()
                    .map_err(|_| OffloadError::lifecycle(format!("invalid PID in \"{line}\"")))?;
                let kill = self.remote_command(&format!(
                    "if ps -q {pid} >/dev/null; then kill {pid}; fi"
                ))?;
                tracing::info!(server = %self.label(), pid, command = %command, "Started background process");
                return Ok(BackgroundJob {
                    pid,
                    launcher: Some(child),
                    kill: Some(kill),
                });
            }
        }

        let _ = child.kill();
        let _ = child.wait();
        Err(OffloadError::lifecycle(format!(
            "could not determine PID of background process \"{command}\""
        )))
    }

    fn check_if_directory_exists(&self, dir: &Path) -> Result<bool> {
        Ok(self.execute_command(&format!("cd {}", quote_path(dir)), false)? == 0)
    }

    /// Create a fresh directory from a mktemp template (trailing `X`s)
    fn create_temporary_directory(&self, template: &Path) -> Result<PathBuf> {
        let out = self
            .capture_output(&format!("mktemp -d {}", quote_path(template)))
            .map_err(|e| {
                OffloadError::lifecycle(format!(
                    "could not create temporary directory {}: {e}",
                    template.display()
                ))
            })?;
        let dir = out.lines().next().map(str::trim).unwrap_or_default();
        if dir.is_empty() {
            return Err(OffloadError::lifecycle(format!(
                "mktemp returned no directory for {}",
                template.display()
            )));
        }
        Ok(PathBuf::from(dir))
    }

    fn create_directory(&self, dir: &Path) -> Result<()> {
        self.execute_command(&format!("mkdir -p {}", quote_path(dir)), true)
            .map_err(|e| {
                OffloadError::lifecycle(format!("could not create {}: {e}", dir.display()))
            })?;
        Ok(())
    }

    fn remove_directory(&self, dir: &Path) -> Result<()> {
        self.execute_command(&format!("rm -rf {}", quote_path(dir)), true)
            .map_err(|e| {
                OffloadError::lifecycle(format!("could not remove {}: {e}", dir.display()))
            })?;
        Ok(())
    }

    /// Entry names in `dir`
    fn list_remote_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let out = self.capture_output(&format!("ls {}", quote_path(dir)))?;
        Ok(non_empty_lines(&out).map(PathBuf::from).collect())
    }

    /// Names of immediate subdirectories of `dir`
    fn list_remote_subdirectories(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let out = self.capture_output(&format!(
            "find {}/ -maxdepth 1 -type d -printf '%P\\n'",
            quote_path(dir)
        ))?;
        Ok(non_empty_lines(&out).map(PathBuf::from).collect())
    }

    /// Make remote listener ports reachable locally and vice versa.
    ///
    /// Backends sharing the local network namespace map every port to itself.
    fn make_ports_accessible(
        &self,
        _remote_listener_ports: &BTreeSet<u16>,
        _local_listener_ports: &BTreeSet<u16>,
    ) -> Result<PortMapping> {
        Ok(PortMapping::identity())
    }
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// Handle on a process started by [`RemoteServer::launch_background_process`]
#[derive(Debug)]
pub struct BackgroundJob {
    pid: u32,
    launcher: Option<Child>,
    kill: Option<Command>,
}

impl BackgroundJob {
    /// PID of the process on the backend
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Terminate the process if it is still alive. Idempotent.
    pub fn kill(&mut self) -> Result<()> {
        if let Some(cmd) = self.kill.take() {
            run_captured(cmd, "kill")?;
            tracing::info!(pid = self.pid, "Killed background process");
        }
        if let Some(mut launcher) = self.launcher.take() {
            let _ = launcher.kill();
            let _ = launcher.wait();
        }
        Ok(())
    }
}

impl Drop for BackgroundJob {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!(pid = self.pid, error = %e, "Failed to kill background process");
        }
    }
}

/// Port translation between the backend and the local machine.
///
/// Tunneling backends keep the tunnel process alive for as long as the
/// mapping exists.
#[derive(Debug)]
pub struct PortMapping {
    remote_to_local: BTreeMap<u16, u16>,
    local_to_remote: BTreeMap<u16, u16>,
    identity: bool,
    tunnel: Option<Child>,
}

impl PortMapping {
    /// Every port maps to itself
    pub fn identity() -> Self {
        Self {
            remote_to_local: BTreeMap::new(),
            local_to_remote: BTreeMap::new(),
            identity: true,
            tunnel: None,
        }
    }

    pub(crate) fn tunneled(
        remote_to_local: BTreeMap<u16, u16>,
        local_to_remote: BTreeMap<u16, u16>,
        tunnel: Child,
    ) -> Self {
        Self {
            remote_to_local,
            local_to_remote,
            identity: false,
            tunnel: Some(tunnel),
        }
    }

    /// Local port where a remote listener on `remote_port` can be reached
    pub fn local_listener_port(&self, remote_port: u16) -> Option<u16> {
        if self.identity {
            Some(remote_port)
        } else {
            self.remote_to_local.get(&remote_port).copied()
        }
    }

    /// Remote port where a local listener on `local_port` can be reached
    pub fn remote_listener_port(&self, local_port: u16) -> Option<u16> {
        if self.identity {
            Some(local_port)
        } else {
            self.local_to_remote.get(&local_port).copied()
        }
    }
}

impl Drop for PortMapping {
    fn drop(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            let _ = tunnel.kill();
            let _ = tunnel.wait();
            tracing::debug!("Closed port tunnel");
        }
    }
}

/// Ask the OS for a currently unused local TCP port
pub(crate) fn find_free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("ls -l"), "'ls -l'");
    }

    #[test]
    fn test_shell_quote_embedded_single_quote() {
        assert_eq!(shell_quote("echo 'hi'"), r#"'echo '\''hi'\'''"#);
    }

    #[test]
    fn test_identity_mapping() {
        let m = PortMapping::identity();
        assert_eq!(m.local_listener_port(8080), Some(8080));
        assert_eq!(m.remote_listener_port(22), Some(22));
    }

    #[test]
    fn test_run_captured_reports_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 3"]);
        let err = run_captured(cmd, "failing").unwrap_err();
        match err {
            OffloadError::ExternalProcessFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_background_process_pid_and_kill() {
        let fake = fake::FakeServer::running("fake", "/base");
        fake.set_tail_script("echo starting; echo PID===4242===PID");

        let mut job = fake.launch_background_process("sleep 100").unwrap();
        assert_eq!(job.pid(), 4242);
        job.kill().unwrap();
        job.kill().unwrap();

        let calls = fake.calls();
        assert_eq!(calls[0], "spawn: sleep 100 & echo PID===$!===PID");
        assert_eq!(
            calls.iter().filter(|c| c.contains("kill 4242")).count(),
            1
        );
    }

    #[test]
    fn test_background_process_without_marker() {
        let fake = fake::FakeServer::running("fake", "/base");
        fake.set_tail_script("echo no marker here");
        assert!(matches!(
            fake.launch_background_process("sleep 100"),
            Err(OffloadError::ResourceLifecycle(_))
        ));
    }

    #[test]
    fn test_default_port_mapping_is_identity() {
        let fake = fake::FakeServer::running("fake", "/base");
        let mapping = fake
            .make_ports_accessible(&BTreeSet::from([8080]), &BTreeSet::from([5432]))
            .unwrap();
        assert_eq!(mapping.local_listener_port(8080), Some(8080));
        assert_eq!(mapping.remote_listener_port(5432), Some(5432));
    }

    #[test]
    fn test_find_free_local_port() {
        let port = find_free_local_port().unwrap();
        assert!(port > 0);
    }

    /// Runs commands through the local `sh`, keeping every default method
    #[derive(Debug)]
    struct LocalShell {
        base: PathBuf,
        running: std::sync::atomic::AtomicBool,
    }

    impl LocalShell {
        fn new(base: &Path) -> Self {
            Self {
                base: base.to_path_buf(),
                running: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    impl RemoteServer for LocalShell {
        fn label(&self) -> &str {
            "local"
        }

        fn base_directory(&self) -> &Path {
            &self.base
        }

        fn host_is_available(&self) -> bool {
            true
        }

        fn check_if_running(&self) -> bool {
            self.running.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn launch(&self) -> Result<()> {
            self.running.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.running.store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn remote_command(&self, command: &str) -> Result<Command> {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            Ok(cmd)
        }

        fn set_transfer_bandwidth_limit(&self, _kbps: u32) {}

        fn transfer_bandwidth_limit(&self) -> u32 {
            0
        }

        fn put_file(&self, _local: &Path, _remote: &Path, _progress: Progress<'_>) -> Result<()> {
            Ok(())
        }

        fn sync_to_remote(
            &self,
            _local_dir: &Path,
            _remote_dir: &Path,
            _exclude: &[String],
            _progress: Progress<'_>,
        ) -> Result<()> {
            Ok(())
        }

        fn sync_to_local(
            &self,
            _local_dir: &Path,
            _remote_dir: &Path,
            _exclude: &[String],
            _progress: Progress<'_>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_execute_command_raises_with_stderr() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        match server.execute_command("echo err >&2; exit 4", true).unwrap_err() {
            OffloadError::ExternalProcessFailed {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(command, "echo err >&2; exit 4");
                assert_eq!(exit_code, 4);
                assert_eq!(stderr, "err");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_execute_command_returns_exit_code() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        assert_eq!(server.execute_command("exit 3", false).unwrap(), 3);
        assert_eq!(server.execute_command("true", true).unwrap(), 0);
    }

    #[test]
    fn test_capture_output_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        assert_eq!(server.capture_output("echo hello").unwrap(), "hello\n");
        assert!(matches!(
            server.capture_output("echo nope >&2; exit 2"),
            Err(OffloadError::ExternalProcessFailed { exit_code: 2, .. })
        ));
    }

    #[test]
    fn test_create_temporary_directory_from_template() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        let dir = server
            .create_temporary_directory(&tmp.path().join("irXXXXXX"))
            .unwrap();
        assert!(dir.is_dir());
        assert!(dir.starts_with(tmp.path()));
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("ir"));
        assert_ne!(name, "irXXXXXX");
    }

    #[test]
    fn test_create_temporary_directory_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        assert!(matches!(
            server.create_temporary_directory(&tmp.path().join("missing/irXXXXXX")),
            Err(OffloadError::ResourceLifecycle(_))
        ));
    }

    #[test]
    fn test_directory_lifecycle() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        let dir = tmp.path().join("case with space/run");

        assert!(!server.check_if_directory_exists(&dir).unwrap());
        server.create_directory(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(server.check_if_directory_exists(&dir).unwrap());

        std::fs::write(dir.join("log"), "x").unwrap();
        server.remove_directory(&dir).unwrap();
        assert!(!dir.exists());
        assert!(!server.check_if_directory_exists(&dir).unwrap());
    }

    #[test]
    fn test_remote_listings() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join("0")).unwrap();
        std::fs::create_dir_all(tmp.path().join("0.5")).unwrap();
        std::fs::create_dir_all(tmp.path().join("constant/polyMesh")).unwrap();
        std::fs::write(tmp.path().join("log.simpleFoam"), "").unwrap();

        let mut entries = server.list_remote_directory(tmp.path()).unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("0"),
                PathBuf::from("0.5"),
                PathBuf::from("constant"),
                PathBuf::from("log.simpleFoam"),
            ]
        );

        let mut subdirs = server.list_remote_subdirectories(tmp.path()).unwrap();
        subdirs.sort();
        assert_eq!(
            subdirs,
            vec![
                PathBuf::from("0"),
                PathBuf::from("0.5"),
                PathBuf::from("constant"),
            ]
        );
    }

    #[test]
    fn test_defaults_require_running_backend() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = LocalShell::new(tmp.path());
        server.stop().unwrap();
        assert!(matches!(
            server.assert_running(),
            Err(OffloadError::ResourceLifecycle(_))
        ));
        assert!(matches!(
            server.execute_command("true", false),
            Err(OffloadError::ResourceLifecycle(_))
        ));
        assert!(matches!(
            server.list_remote_directory(tmp.path()),
            Err(OffloadError::ResourceLifecycle(_))
        ));
    }
}
