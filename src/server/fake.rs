//! In-memory backend for tests: records every call, never touches the network

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Progress, RemoteServer};
use crate::errors::{OffloadError, Result};

#[derive(Debug, Default)]
pub(crate) struct FakeServer {
    label: String,
    base_directory: PathBuf,
    running: AtomicBool,
    calls: Mutex<Vec<String>>,
    directories: Mutex<BTreeSet<PathBuf>>,
    listing: Mutex<Vec<PathBuf>>,
    status_output: Mutex<String>,
    tail_script: Mutex<Option<String>>,
    kill_successes: AtomicUsize,
    temp_counter: AtomicUsize,
    bandwidth_limit: AtomicU32,
    last_excludes: Mutex<Vec<String>>,
}

impl FakeServer {
    pub fn new(label: &str, base_directory: &str) -> Self {
        Self {
            label: label.to_string(),
            base_directory: PathBuf::from(base_directory),
            ..Self::default()
        }
    }

    /// Already launched
    pub fn running(label: &str, base_directory: &str) -> Self {
        let server = Self::new(label, base_directory);
        server.running.store(true, Ordering::SeqCst);
        server
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn add_directory(&self, dir: impl Into<PathBuf>) {
        self.directories.lock().unwrap().insert(dir.into());
    }

    pub fn has_directory(&self, dir: &Path) -> bool {
        self.directories.lock().unwrap().contains(dir)
    }

    pub fn set_listing(&self, entries: &[&str]) {
        *self.listing.lock().unwrap() = entries.iter().map(PathBuf::from).collect();
    }

    /// Text returned by every captured-output command (queue status)
    pub fn set_status_output(&self, text: &str) {
        *self.status_output.lock().unwrap() = text.to_string();
    }

    /// Local shell script run in place of any spawned remote command
    pub fn set_tail_script(&self, script: &str) {
        *self.tail_script.lock().unwrap() = Some(script.to_string());
    }

    /// Number of `kill` requests that succeed before the queue reports empty
    pub fn set_kill_successes(&self, n: usize) {
        self.kill_successes.store(n, Ordering::SeqCst);
    }

    pub fn last_excludes(&self) -> Vec<String> {
        self.last_excludes.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RemoteServer for FakeServer {
    fn label(&self) -> &str {
        &self.label
    }

    fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    fn host_is_available(&self) -> bool {
        true
    }

    fn check_if_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn launch(&self) -> Result<()> {
        self.record("launch".to_string());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("stop".to_string());
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn remote_command(&self, command: &str) -> Result<Command> {
        self.record(format!("spawn: {command}"));
        let script = self
            .tail_script
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "true".to_string());
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &script]);
        Ok(cmd)
    }

    fn execute_command(&self, command: &str, throw_on_fail: bool) -> Result<i32> {
        self.assert_running()?;
        self.record(format!("execute: {command}"));
        let code = if command.ends_with(" -k") {
            let left = self.kill_successes.load(Ordering::SeqCst);
            if left > 0 {
                self.kill_successes.store(left - 1, Ordering::SeqCst);
                0
            } else {
                1
            }
        } else {
            0
        };
        if throw_on_fail && code != 0 {
            return Err(OffloadError::ExternalProcessFailed {
                command: command.to_string(),
                exit_code: code,
                stderr: String::new(),
            });
        }
        Ok(code)
    }

    fn capture_output(&self, command: &str) -> Result<String> {
        self.assert_running()?;
        self.record(format!("capture: {command}"));
        Ok(self.status_output.lock().unwrap().clone())
    }

    fn set_transfer_bandwidth_limit(&self, kbps: u32) {
        self.bandwidth_limit.store(kbps, Ordering::SeqCst);
    }

    fn transfer_bandwidth_limit(&self) -> u32 {
        self.bandwidth_limit.load(Ordering::SeqCst)
    }

    fn put_file(&self, local: &Path, remote: &Path, _progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        self.record(format!("put_file: {} -> {}", local.display(), remote.display()));
        Ok(())
    }

    fn sync_to_remote(&self, local_dir: &Path, remote_dir: &Path, exclude: &[String], _progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        self.record(format!("sync_to_remote: {} -> {}", local_dir.display(), remote_dir.display()));
        *self.last_excludes.lock().unwrap() = exclude.to_vec();
        Ok(())
    }

    fn sync_to_local(&self, local_dir: &Path, remote_dir: &Path, exclude: &[String], _progress: Progress<'_>) -> Result<()> {
        self.assert_running()?;
        self.record(format!("sync_to_local: {} -> {}", remote_dir.display(), local_dir.display()));
        *self.last_excludes.lock().unwrap() = exclude.to_vec();
        Ok(())
    }

    fn check_if_directory_exists(&self, dir: &Path) -> Result<bool> {
        self.assert_running()?;
        self.record(format!("check_dir: {}", dir.display()));
        Ok(self.has_directory(dir))
    }

    fn create_temporary_directory(&self, template: &Path) -> Result<PathBuf> {
        self.assert_running()?;
        self.record(format!("mktemp: {}", template.display()));
        let n = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        let name = template
            .file_name()
            .map(|f| f.to_string_lossy().trim_end_matches('X').to_string())
            .unwrap_or_default();
        let dir = template.with_file_name(format!("{name}{n:06}"));
        self.add_directory(dir.clone());
        Ok(dir)
    }

    fn create_directory(&self, dir: &Path) -> Result<()> {
        self.assert_running()?;
        self.record(format!("mkdir: {}", dir.display()));
        self.add_directory(dir.to_path_buf());
        Ok(())
    }

    fn remove_directory(&self, dir: &Path) -> Result<()> {
        self.assert_running()?;
        self.record(format!("rmdir: {}", dir.display()));
        self.directories.lock().unwrap().remove(dir);
        Ok(())
    }

    fn list_remote_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.assert_running()?;
        self.record(format!("ls: {}", dir.display()));
        Ok(self.listing.lock().unwrap().clone())
    }

    fn list_remote_subdirectories(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.assert_running()?;
        self.record(format!("subdirs: {}", dir.display()));
        Ok(self.listing.lock().unwrap().clone())
    }
}
