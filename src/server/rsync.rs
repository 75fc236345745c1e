//! rsync invocation and progress parsing shared by all backends

use std::io::Read;
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;

use super::Progress;
use crate::errors::{OffloadError, Result};

/// Case content that never crosses the wire in either direction
const BASELINE_EXCLUDES: &[&str] = &[
    "*.foam",
    "*.socket",
    "backup",
    "archive",
    "mnt_remote",
    "processor*",
];

/// Excluded only when uploading, so results can be pulled back
const UPLOAD_ONLY_EXCLUDES: &[&str] = &["postProcessing"];

static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r".* ([^ ]*)% *([^ ]*) *([^ ]*) \(xfr#([0-9]+), (?:to|ir)-chk=([0-9]+)/([0-9]+)\)")
        .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Upload,
    Download,
}

/// rsync options (everything before the source/destination pair).
///
/// Both directions mirror with `--delete`; excluded paths are protected
/// from deletion on the receiving side.
pub(crate) fn options(direction: Direction, exclude: &[String], bwlimit_kbps: u32) -> Vec<String> {
    let mut args = vec![
        "-az".to_string(),
        "--delete".to_string(),
        "--info=progress2".to_string(),
    ];
    if bwlimit_kbps > 0 {
        args.push(format!("--bwlimit={bwlimit_kbps}"));
    }

    let mut excludes: Vec<&str> = BASELINE_EXCLUDES.to_vec();
    if direction == Direction::Upload {
        excludes.extend_from_slice(UPLOAD_ONLY_EXCLUDES);
    }
    excludes.extend(exclude.iter().map(String::as_str));
    for pattern in excludes {
        args.push(format!("--exclude={pattern}"));
    }
    args
}

/// Parse one `--info=progress2` status line into (percent, message)
pub(crate) fn parse_progress_line(line: &str) -> Option<(u8, String)> {
    let caps = PROGRESS_LINE.captures(line)?;
    let to_check: f64 = caps[5].parse().ok()?;
    let total: f64 = caps[6].parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    let percent = ((total - to_check) / total * 100.0).clamp(0.0, 100.0) as u8;
    let message = format!("{}, {} (current file: {}%)", &caps[2], &caps[3], &caps[1]);
    Some((percent, message))
}

/// Run a prepared rsync command, forwarding progress updates.
///
/// rsync rewrites its status line with carriage returns, so both `\r` and
/// `\n` terminate a line here. stderr is drained on its own thread so a
/// chatty transfer cannot block on a full pipe.
pub(crate) fn run(mut cmd: Command, mut progress: Progress<'_>) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    tracing::debug!(command = ?cmd, "Starting transfer");

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OffloadError::spawn(program.clone(), e))?;

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        })
    });

    if let Some(mut stdout) = child.stdout.take() {
        let mut pending = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stdout.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for &b in &buf[..n] {
                if b == b'\r' || b == b'\n' {
                    report(&pending, &mut progress);
                    pending.clear();
                } else {
                    pending.push(b);
                }
            }
        }
        report(&pending, &mut progress);
    }

    let status = child.wait()?;
    let stderr = stderr_reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();
    if !status.success() {
        return Err(OffloadError::ExternalProcessFailed {
            command: program,
            exit_code: status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }

    if let Some(cb) = progress.as_mut() {
        cb(100, "done");
    }
    Ok(())
}

fn report(line: &[u8], progress: &mut Progress<'_>) {
    if line.is_empty() {
        return;
    }
    let line = String::from_utf8_lossy(line);
    if let Some((percent, message)) = parse_progress_line(&line) {
        if let Some(cb) = progress.as_mut() {
            cb(percent, &message);
        }
    }
}
