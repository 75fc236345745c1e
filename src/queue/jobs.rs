//! Queue daemon status listing
//!
//! The status sub-command prints a header followed by one row per job:
//!
//! ```text
//! ID   State      Output               E-Level  Times(r/u/s)   Command [run=1/1]
//! 2    running    /tmp/ts-out.Xa0b1c                           simpleFoam -parallel
//! 3    queued     (file)                                       reconstructPar
//! 1    finished   /tmp/ts-out.Q9z8y7   0        1.20/0.90/0.10 blockMesh
//! ```

use std::ops::Deref;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// id, state, output, command
static PENDING_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+(\S+)\s+(\S+)\s+(.*)$").expect("valid regex"));

/// id, state, output, exit level, times, command
static FINISHED_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(.*)$").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Unknown,
}

impl JobState {
    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "finished" => JobState::Finished,
            _ => JobState::Unknown,
        }
    }
}

/// One row of the daemon's status listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: u32,
    pub state: JobState,
    /// Output file, or `(file)` while queued
    pub output: String,
    /// Only known for finished jobs
    pub exit_code: Option<i32>,
    pub command_line: String,
}

/// Point-in-time snapshot of the queue, in daemon order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct JobList(Vec<Job>);

impl JobList {
    pub fn has_running_jobs(&self) -> bool {
        self.0.iter().any(|j| j.state == JobState::Running)
    }

    pub fn has_queued_jobs(&self) -> bool {
        self.0.iter().any(|j| j.state == JobState::Queued)
    }

    /// Any finished job with a nonzero (or unreadable) exit code
    pub fn has_failed_jobs(&self) -> bool {
        self.0
            .iter()
            .any(|j| j.state == JobState::Finished && j.exit_code != Some(0))
    }

    pub fn into_vec(self) -> Vec<Job> {
        self.0
    }
}

impl Deref for JobList {
    type Target = [Job];

    fn deref(&self) -> &[Job] {
        &self.0
    }
}

impl IntoIterator for JobList {
    type Item = Job;
    type IntoIter = std::vec::IntoIter<Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

fn parse_row(line: &str) -> Option<Job> {
    let mut tokens = line.split_whitespace();
    let _id = tokens.next()?;
    let state = JobState::from_keyword(tokens.next()?);

    if state == JobState::Finished {
        let caps = FINISHED_ROW.captures(line)?;
        Some(Job {
            id: caps[1].parse().ok()?,
            state,
            output: caps[3].to_string(),
            exit_code: caps[4].parse().ok(),
            command_line: caps[6].trim().to_string(),
        })
    } else {
        let caps = PENDING_ROW.captures(line)?;
        Some(Job {
            id: caps[1].parse().ok()?,
            state,
            output: caps[3].to_string(),
            exit_code: None,
            command_line: caps[4].trim().to_string(),
        })
    }
}

/// Parse the status listing. The header and blank lines are skipped;
/// rows that fit neither grammar are logged and skipped.
pub fn parse_job_list(text: &str) -> JobList {
    let mut jobs = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("ID ") || trimmed == "ID" {
            continue;
        }
        match parse_row(trimmed) {
            Some(job) => jobs.push(job),
            None => tracing::warn!(row = %trimmed, "Skipping unparseable queue status row"),
        }
    }
    JobList(jobs)
}
