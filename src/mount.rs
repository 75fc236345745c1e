//! sshfs mounts of remote directories
//!
//! A [`MountPoint`] owns the mount for its lifetime: dropping it unmounts
//! (unless asked to keep the mount) and removes a freshly allocated
//! mountpoint directory. The directory is only removed after a successful
//! unmount, and never recursively.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::errors::{OffloadError, Result};
use crate::location::RemoteLocation;
use crate::server::RemoteServer;

const PROC_MOUNTS: &str = "/proc/mounts";

/// One line of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

/// Snapshot of the kernel mount table
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

/// Decode the octal escapes (`\040` for space etc.) used in /proc/mounts
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = (bytes[i] == b'\\' && i + 3 < bytes.len())
            .then(|| &bytes[i + 1..i + 4])
            .filter(|digits| digits.iter().all(|b| (b'0'..=b'7').contains(b)))
            .and_then(|digits| {
                let code = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                u8::try_from(code).ok()
            });
        if let Some(byte) = escape {
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl MountTable {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = unescape_mount_field(fields.next()?);
                let mountpoint = PathBuf::from(unescape_mount_field(fields.next()?));
                let fstype = fields.next()?.to_string();
                Some(MountEntry {
                    source,
                    mountpoint,
                    fstype,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn read() -> Result<Self> {
        let text = std::fs::read_to_string(PROC_MOUNTS).map_err(|e| {
            OffloadError::lifecycle(format!("cannot read {PROC_MOUNTS}: {e}"))
        })?;
        Ok(Self::parse(&text))
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Whether something is mounted at a path equivalent to `path`
    pub fn is_mounted(&self, path: &Path) -> bool {
        let wanted = canonical(path);
        self.entries
            .iter()
            .any(|e| e.mountpoint == path || canonical(&e.mountpoint) == wanted)
    }
}

/// A remote directory mounted at a local path
#[derive(Debug)]
pub struct MountPoint {
    mountpoint: PathBuf,
    keep: bool,
    owns_mountpoint: bool,
}

impl MountPoint {
    /// Mount `remote_dir` at `mountpoint`.
    ///
    /// With `expect_already_mounted` an existing mount is adopted and it is an
    /// error if there is none; otherwise an existing mount is an error.
    pub fn new(
        mountpoint: &Path,
        server: &dyn RemoteServer,
        remote_dir: &Path,
        keep: bool,
        expect_already_mounted: bool,
    ) -> Result<Self> {
        Self::with_table(
            &MountTable::read()?,
            mountpoint,
            server,
            remote_dir,
            keep,
            expect_already_mounted,
        )
    }

    fn with_table(
        table: &MountTable,
        mountpoint: &Path,
        server: &dyn RemoteServer,
        remote_dir: &Path,
        keep: bool,
        expect_already_mounted: bool,
    ) -> Result<Self> {
        let mounted = table.is_mounted(mountpoint);
        match (mounted, expect_already_mounted) {
            (true, true) => {
                info!(mountpoint = %mountpoint.display(), "Adopting existing mount");
            }
            (false, true) => {
                return Err(OffloadError::lifecycle(format!(
                    "expected an existing mount at {}",
                    mountpoint.display()
                )))
            }
            (true, false) => {
                return Err(OffloadError::lifecycle(format!(
                    "{} is already mounted",
                    mountpoint.display()
                )))
            }
            (false, false) => {
                std::fs::create_dir_all(mountpoint)?;
                mount(server, remote_dir, mountpoint)?;
            }
        }

        Ok(Self {
            mountpoint: mountpoint.to_path_buf(),
            keep,
            owns_mountpoint: false,
        })
    }

    /// Mount at a fresh temporary directory, removed again on drop
    pub fn temporary(server: &dyn RemoteServer, remote_dir: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("remote-")
            .tempdir()
            .map_err(|e| OffloadError::lifecycle(format!("cannot create mountpoint: {e}")))?;
        // Removal is handled in `drop`, after the unmount
        let mountpoint = dir.keep();
        if let Err(e) = mount(server, remote_dir, &mountpoint) {
            let _ = std::fs::remove_dir(&mountpoint);
            return Err(e);
        }
        Ok(Self {
            mountpoint,
            keep: false,
            owns_mountpoint: true,
        })
    }

    /// Mount the directory of an active location at a fresh temporary path
    pub fn for_location(location: &RemoteLocation) -> Result<Self> {
        location.assert_active()?;
        match (location.server(), location.remote_dir()) {
            (Some(server), Some(dir)) => Self::temporary(server.as_ref(), dir),
            _ => Err(OffloadError::NotActive {
                directory: location.remote_dir().map(Path::to_path_buf),
            }),
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Whether the mountpoint directory was allocated here
    pub fn owns_mountpoint(&self) -> bool {
        self.owns_mountpoint
    }
}

fn mount(server: &dyn RemoteServer, remote_dir: &Path, mountpoint: &Path) -> Result<()> {
    let target = server.ssh_target().ok_or_else(|| {
        OffloadError::lifecycle(format!(
            "remote server \"{}\" cannot be mounted with sshfs",
            server.label()
        ))
    })?;
    // SAFETY: getuid/getgid cannot fail and have no preconditions
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

    let output = Command::new("sshfs")
        .arg("-o")
        .arg(format!("uid={uid},gid={gid},follow_symlinks"))
        .arg(format!("{target}:{}", remote_dir.display()))
        .arg(mountpoint)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| OffloadError::spawn("sshfs", e))?;
    if !output.status.success() {
        return Err(OffloadError::lifecycle(format!(
            "sshfs mount of {target}:{} at {} failed: {}",
            remote_dir.display(),
            mountpoint.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    info!(remote = %format!("{target}:{}", remote_dir.display()), mountpoint = %mountpoint.display(), "Mounted remote directory");
    Ok(())
}

fn unmount(mountpoint: &Path) -> Result<()> {
    let output = Command::new("fusermount")
        .args(["-z", "-u"])
        .arg(mountpoint)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| OffloadError::spawn("fusermount", e))?;
    if !output.status.success() {
        return Err(OffloadError::lifecycle(format!(
            "unmounting {} failed: {}",
            mountpoint.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

impl Drop for MountPoint {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = unmount(&self.mountpoint) {
            // Still mounted: the directory holds remote content
            warn!(mountpoint = %self.mountpoint.display(), error = %e, "Unmount failed, leaving mountpoint in place");
            return;
        }
        info!(mountpoint = %self.mountpoint.display(), "Unmounted remote directory");
        if self.owns_mountpoint {
            if let Err(e) = std::fs::remove_dir(&self.mountpoint) {
                warn!(mountpoint = %self.mountpoint.display(), error = %e, "Failed to remove mountpoint");
            }
        }
    }
}
