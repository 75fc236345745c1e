//! Client for the task-spooler queue daemon
//!
//! Every call is one invocation of the daemon's CLI with `TS_SOCKET` set to
//! the client's socket, either through a local `sh -c` or on a remote
//! backend. Sub-commands used:
//! - no arguments: status listing
//! - `<cmd>` / `-d <cmd>`: enqueue, optionally only after the previous job
//! - `-c`: wait for (and print) the last job, `-t`: follow its output
//! - `-k` / `-C` / `-K`: kill current job, clear finished, kill daemon

mod jobs;
mod tail;

pub use jobs::{parse_job_list, Job, JobList, JobState};
pub use tail::TailReceiver;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{OffloadError, Result};
use crate::server::{quote_path, run_captured, shell_quote, RemoteServer};
use tail::TailSession;

const DEFAULT_PROGRAM: &str = "tsp";

/// Client of one queue daemon, addressed by its socket path
#[derive(Debug)]
pub struct CommandQueueClient {
    socket: PathBuf,
    server: Option<Arc<dyn RemoteServer>>,
    workdir: Option<PathBuf>,
    preamble: Option<String>,
    program: String,
    stop_idle_daemon: bool,
    tail: Option<TailSession>,
}

impl CommandQueueClient {
    /// Queue on the local machine
    pub fn local(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            server: None,
            workdir: None,
            preamble: None,
            program: DEFAULT_PROGRAM.to_string(),
            stop_idle_daemon: true,
            tail: None,
        }
    }

    /// Queue on a remote backend
    pub fn remote(server: Arc<dyn RemoteServer>, socket: impl Into<PathBuf>) -> Self {
        let mut client = Self::local(socket);
        client.server = Some(server);
        client
    }

    /// Leave the daemon running when the client is dropped, even if idle.
    /// Used when the daemon outlives the process (persisted locations).
    pub fn keep_daemon(mut self) -> Self {
        self.stop_idle_daemon = false;
        self
    }

    /// Run every daemon invocation from `dir`
    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Shell text (typically `source ...`) run before every invocation
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        let preamble = preamble.into();
        self.preamble = (!preamble.trim().is_empty()).then_some(preamble);
        self
    }

    /// Daemon CLI to call; inserted verbatim, so it may carry arguments
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn is_remote(&self) -> bool {
        self.server.is_some()
    }

    /// Full shell line: socket export, preamble, working directory, `body`
    fn shell_line(&self, body: &str) -> String {
        let mut line = format!("export TS_SOCKET={}; ", quote_path(&self.socket));
        if let Some(preamble) = &self.preamble {
            let preamble = preamble.trim_end();
            line.push_str(preamble);
            if !preamble.ends_with(';') {
                line.push(';');
            }
            line.push(' ');
        }
        if let Some(dir) = &self.workdir {
            line.push_str(&format!("cd {} && ", quote_path(dir)));
        }
        line.push_str(body);
        line
    }

    fn daemon(&self, args: &str) -> String {
        if args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {args}", self.program)
        }
    }

    fn local_command(line: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", line]);
        cmd
    }

    /// Run `body`, passing stdout through; returns the exit code
    fn run_status(&self, body: &str, throw_on_fail: bool) -> Result<i32> {
        let line = self.shell_line(body);
        debug!(command = %line, "Queue invocation");
        match &self.server {
            Some(server) => server.execute_command(&line, throw_on_fail),
            None => {
                let output = Self::local_command(&line)
                    .stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::piped())
                    .output()
                    .map_err(|e| OffloadError::spawn("sh", e))?;
                let code = output.status.code().unwrap_or(-1);
                if throw_on_fail && code != 0 {
                    return Err(OffloadError::ExternalProcessFailed {
                        command: body.to_string(),
                        exit_code: code,
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
                Ok(code)
            }
        }
    }

    fn run_capture(&self, body: &str) -> Result<String> {
        let line = self.shell_line(body);
        match &self.server {
            Some(server) => server.capture_output(&line),
            None => run_captured(Self::local_command(&line), body),
        }
    }

    fn prepare(&self, body: &str) -> Result<Command> {
        let line = self.shell_line(body);
        match &self.server {
            Some(server) => server.remote_command(&line),
            None => Ok(Self::local_command(&line)),
        }
    }

    /// Current queue contents
    pub fn jobs(&self) -> Result<JobList> {
        let out = self.run_capture(&self.daemon(""))?;
        Ok(parse_job_list(&out))
    }

    /// Enqueue `argv` as-is; returns the daemon's exit code
    pub fn start_job(&self, argv: &[String]) -> Result<i32> {
        let args: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
        let code = self.run_status(&self.daemon(&args.join(" ")), false)?;
        info!(socket = %self.socket.display(), argv = ?argv, code, "Enqueued job");
        Ok(code)
    }

    /// Enqueue a shell command line.
    ///
    /// With `wait_for_previous_finished` the job does not start before the
    /// previously queued one has ended.
    pub fn queue_command(&self, command: &str, wait_for_previous_finished: bool) -> Result<()> {
        let mode = if wait_for_previous_finished { "-d " } else { "" };
        let args = format!("{mode}sh -c {}", shell_quote(command));
        self.run_status(&self.daemon(&args), true)?;
        info!(socket = %self.socket.display(), command = %command, wait_for_previous_finished, "Queued command");
        Ok(())
    }

    /// Block until the queue has drained
    pub fn wait_queue_finished(&self) -> Result<()> {
        let body = format!(
            "while {}; do {}; done",
            self.daemon("-c"),
            self.daemon("-C")
        );
        self.run_status(&body, false)?;
        Ok(())
    }

    /// Block until the most recently queued job has ended
    pub fn wait_last_command_finished(&self) -> Result<()> {
        self.run_status(&self.daemon("-t"), false)?;
        Ok(())
    }

    /// Clear finished jobs from the listing
    pub fn clean(&self) -> Result<i32> {
        self.run_status(&self.daemon("-C"), false)
    }

    /// Kill the running job; nonzero when there was nothing to kill
    pub fn kill(&self) -> Result<i32> {
        self.run_status(&self.daemon("-k"), false)
    }

    /// Kill jobs until the daemon reports nothing left to kill
    pub fn cancel_all_jobs(&self) -> Result<()> {
        let mut killed = 0usize;
        while self.kill()? == 0 {
            killed += 1;
            self.clean()?;
        }
        self.clean()?;
        info!(socket = %self.socket.display(), killed, "Cancelled queued jobs");
        Ok(())
    }

    /// Shut the daemon down
    pub fn stop_daemon(&self) -> Result<i32> {
        self.run_status(&self.daemon("-K"), false)
    }

    /// Follow the current job's output.
    ///
    /// Any previous tail is stopped first. With `blocking` the call returns
    /// only once the followed job has ended.
    pub fn start_tail(&mut self, receiver: TailReceiver, blocking: bool) -> Result<()> {
        self.stop_tail();
        let command = self.prepare(&format!("{} 2>&1", self.daemon("-t")))?;
        let mut session = TailSession::start(command, receiver)?;
        if blocking {
            session.wait();
        }
        self.tail = Some(session);
        Ok(())
    }

    /// Register another receiver on the active tail; false if none is active
    pub fn add_tail_receiver(&self, receiver: TailReceiver) -> bool {
        match &self.tail {
            Some(session) => {
                session.add_receiver(receiver);
                true
            }
            None => false,
        }
    }

    pub fn is_tail_running(&self) -> bool {
        self.tail.as_ref().is_some_and(TailSession::is_running)
    }

    /// Stop following output. Safe when no tail is active.
    pub fn stop_tail(&mut self) {
        if let Some(mut session) = self.tail.take() {
            session.stop();
            debug!(socket = %self.socket.display(), "Stopped tail");
        }
    }
}

impl Drop for CommandQueueClient {
    fn drop(&mut self) {
        self.stop_tail();
        if !self.stop_idle_daemon {
            return;
        }
        match self.jobs() {
            Ok(jobs) if !jobs.has_running_jobs() && !jobs.has_queued_jobs() => {
                if let Err(e) = self.stop_daemon() {
                    warn!(socket = %self.socket.display(), error = %e, "Failed to stop idle queue daemon");
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(socket = %self.socket.display(), error = %e, "Queue status unavailable during teardown")
            }
        }
    }
}
