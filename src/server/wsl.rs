//! Linux distributions running under WSL

use std::path::{Component, Path, PathBuf, Prefix};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::rsync::{self, Direction};
use super::{shell_quote, Progress, RemoteServer};
use crate::errors::Result;

/// A WSL distribution driven through its launcher executable
/// (`<exe> run bash -lc '<command>'`)
#[derive(Debug)]
pub struct WslServer {
    label: String,
    base_directory: PathBuf,
    executable: PathBuf,
    running: AtomicBool,
    bandwidth_limit: AtomicU32,
}

impl WslServer {
    pub fn new(
        label: impl Into<String>,
        base_directory: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label: label.into(),
            base_directory: base_directory.into(),
            executable: executable.into(),
            running: AtomicBool::new(false),
            bandwidth_limit: AtomicU32::new(0),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// rsync runs inside the distribution, so both ends are WSL paths
    fn rsync(&self, direction: Direction, src: String, dst: String, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        let mut line = String::from("rsync");
        for arg in rsync::options(direction, exclude, self.transfer_bandwidth_limit())
            .into_iter()
            .chain([src, dst])
        {
            line.push(' ');
            line.push_str(&shell_quote(&arg));
        }
        rsync::run(self.remote_command(&line)?, progress)
    }
}

/// Translate a Windows path into the form seen from inside WSL.
///
/// `C:\a\b` becomes `/mnt/c/a/b`. Paths without a drive letter only get
/// their separators flipped.
pub fn windows_to_wsl_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    let bytes = text.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let rest = text[2..].replace('\\', "/");
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return format!("/mnt/{drive}");
        }
        return format!("/mnt/{drive}/{rest}");
    }

    // Native Windows builds parse the drive into a prefix component
    if let Some(Component::Prefix(prefix)) = path.components().next() {
        if let Prefix::Disk(d) | Prefix::VerbatimDisk(d) = prefix.kind() {
            let drive = (d as char).to_ascii_lowercase();
            let rest: Vec<String> = path
                .components()
                .skip(1)
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            return format!("/mnt/{drive}/{}", rest.join("/"));
        }
    }

    text.replace('\\', "/")
}

impl RemoteServer for WslServer {
    fn label(&self) -> &str {
        &self.label
    }

    fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    fn host_is_available(&self) -> bool {
        Command::new(&self.executable)
            .args(["run", "true"])
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
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn remote_command(&self, command: &str) -> Result<Command> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(["run", "bash", "-lc"]).arg(shell_quote(command));
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
        self.rsync(
            Direction::Upload,
            windows_to_wsl_path(local),
            remote.to_string_lossy().into_owned(),
            &[],
            progress,
        )
    }

    fn sync_to_remote(&self, local_dir: &Path, remote_dir: &Path, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        tracing::info!(server = %self.label, local = %local_dir.display(), remote = %remote_dir.display(), "Syncing to remote");
        self.rsync(
            Direction::Upload,
            format!("{}/", windows_to_wsl_path(local_dir)),
            remote_dir.to_string_lossy().into_owned(),
            exclude,
            progress,
        )
    }

    fn sync_to_local(&self, local_dir: &Path, remote_dir: &Path, exclude: &[String], progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        tracing::info!(server = %self.label, local = %local_dir.display(), remote = %remote_dir.display(), "Syncing to local");
        self.rsync(
            Direction::Download,
            format!("{}/", remote_dir.display()),
            windows_to_wsl_path(local_dir),
            exclude,
            progress,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_to_wsl_path() {
        assert_eq!(windows_to_wsl_path(Path::new(r"C:\a\b")), "/mnt/c/a/b");
        assert_eq!(windows_to_wsl_path(Path::new(r"d:\Cases\pipe flow")), "/mnt/d/Cases/pipe flow");
        assert_eq!(windows_to_wsl_path(Path::new(r"E:\")), "/mnt/e");
        assert_eq!(windows_to_wsl_path(Path::new("/home/user/case")), "/home/user/case");
    }

    #[test]
    fn test_remote_command_uses_run_subcommand() {
        let server = WslServer::new("wsl", "/home/user/runs", "ubuntu.exe");
        let cmd = server.remote_command("ls -l").unwrap();
        assert_eq!(cmd.get_program(), "ubuntu.exe");
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["run", "bash", "-lc", "'ls -l'"]);
    }

    #[test]
    fn test_launch_stop() {
        let server = WslServer::new("wsl", "/home/user/runs", "ubuntu.exe");
        server.launch().unwrap();
        assert!(server.check_if_running());
        server.stop().unwrap();
        assert!(!server.check_if_running());
    }

    #[test]
    fn test_missing_executable_is_unavailable() {
        let server = WslServer::new("wsl", "/home/user/runs", "/nonexistent/ubuntu.exe");
        assert!(!server.host_is_available());
    }
}
