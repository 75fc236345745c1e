//! Live output following for the queue's current job
//!
//! One session owns one subprocess. A dedicated worker thread drives a
//! current-thread tokio runtime that reads the pipe line by line and hands
//! each line to the registered receivers. Cancellation goes through a
//! `CancellationToken`; stopping joins the worker before returning.
//!
//! The subprocess leads its own process group, so stopping also reaches
//! whatever it spawned (the queue CLI behind a local `sh -c`).

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{OffloadError, Result};

/// Callback invoked with every complete output line
pub type TailReceiver = Box<dyn FnMut(&str) + Send>;

type Receivers = Arc<Mutex<Vec<TailReceiver>>>;

pub(crate) struct TailSession {
    cancel: CancellationToken,
    receivers: Receivers,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TailSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailSession")
            .field("running", &self.is_running())
            .finish()
    }
}

impl TailSession {
    /// Spawn `command` and start pumping its stdout to `receiver`
    pub(crate) fn start(mut command: std::process::Command, receiver: TailReceiver) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let program = command.get_program().to_string_lossy().into_owned();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let mut command = tokio::process::Command::from(command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = {
            let _guard = runtime.enter();
            command
                .spawn()
                .map_err(|e| OffloadError::spawn(program.clone(), e))?
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OffloadError::lifecycle("tail process has no stdout"))?;

        let cancel = CancellationToken::new();
        let receivers: Receivers = Arc::new(Mutex::new(vec![receiver]));

        let worker = {
            let cancel = cancel.clone();
            let receivers = receivers.clone();
            std::thread::Builder::new()
                .name("queue-tail".to_string())
                .spawn(move || runtime.block_on(pump(child, stdout, receivers, cancel)))?
        };
        debug!(program = %program, "Started tail session");

        Ok(Self {
            cancel,
            receivers,
            worker: Some(worker),
        })
    }

    pub(crate) fn add_receiver(&self, receiver: TailReceiver) {
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.push(receiver);
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Block until the tailed process ends on its own
    pub(crate) fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Tail worker panicked");
            }
        }
    }

    /// Terminate the process and join the worker. Idempotent.
    pub(crate) fn stop(&mut self) {
        self.cancel.cancel();
        self.wait();
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(mut child: Child, stdout: ChildStdout, receivers: Receivers, cancel: CancellationToken) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate_group(&child);
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Tail process already gone");
                }
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => dispatch(&receivers, &line),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Reading tail output failed");
                    break;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) => debug!(%status, "Tail session ended"),
        Err(e) => warn!(error = %e, "Waiting for tail process failed"),
    }
}

/// Send SIGTERM to the process group led by `child`
#[cfg(unix)]
fn terminate_group(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group
    // created for this child at spawn.
    if unsafe { libc::kill(-pid, libc::SIGTERM) } != 0 {
        debug!(pgid = pid, "Tail process group already gone");
    }
}

#[cfg(not(unix))]
fn terminate_group(_child: &Child) {}

fn dispatch(receivers: &Receivers, line: &str) {
    match receivers.lock() {
        Ok(mut receivers) => {
            for receiver in receivers.iter_mut() {
                receiver(line);
            }
        }
        Err(_) => warn!("Tail receivers poisoned, dropping line"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    fn collector() -> (Arc<Mutex<Vec<String>>>, TailReceiver) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        (lines, Box::new(move |l: &str| sink.lock().unwrap().push(l.to_string())))
    }

    #[test]
    fn test_lines_arrive_in_order() {
        let (lines, receiver) = collector();
        let mut session = TailSession::start(sh("printf 'a\\nb\\nc\\n'"), receiver).unwrap();
        session.wait();
        assert!(!session.is_running());
        assert_eq!(*lines.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_terminates_endless_process() {
        let (lines, receiver) = collector();
        let mut session = TailSession::start(
            sh("while true; do echo tick; sleep 0.05; done"),
            receiver,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while lines.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(session.is_running());

        session.stop();
        assert!(!session.is_running());
        let seen = lines.lock().unwrap().len();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(lines.lock().unwrap().len(), seen);

        // Second stop is a no-op
        session.stop();
        assert!(!session.is_running());
    }

    #[test]
    fn test_added_receiver_sees_later_lines() {
        let (first, receiver) = collector();
        let session = TailSession::start(
            sh("sleep 0.2; echo late"),
            receiver,
        )
        .unwrap();
        let (second, extra) = collector();
        session.add_receiver(extra);

        let mut session = session;
        session.wait();
        assert_eq!(*first.lock().unwrap(), vec!["late"]);
        assert_eq!(*second.lock().unwrap(), vec!["late"]);
    }

    fn process_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // State follows the parenthesised command name
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) => true,
        }
    }

    #[test]
    fn test_stop_reaches_grandchildren() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pidfile = tmp.path().join("pid");
        let (lines, receiver) = collector();
        let mut session = TailSession::start(
            sh(&format!(
                "sleep 30 & echo $! > '{}'; echo started; wait",
                pidfile.display()
            )),
            receiver,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while lines.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*lines.lock().unwrap(), vec!["started"]);
        let pid = std::fs::read_to_string(&pidfile).unwrap().trim().to_string();
        assert!(!process_gone(&pid));

        session.stop();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !process_gone(&pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(process_gone(&pid));
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let (_, receiver) = collector();
        let err = TailSession::start(Command::new("/nonexistent/tail-program"), receiver).unwrap_err();
        assert!(matches!(err, OffloadError::Spawn { .. }));
    }
}
