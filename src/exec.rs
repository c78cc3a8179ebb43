//! Shell command execution with incremental output.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use wait_timeout::ChildExt;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Exit code reported when the process status carries neither a code nor a
/// signal.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `bash -lc` in {workdir}: {source}")]
    Spawn {
        workdir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One element of a command's output, in arrival order.
///
/// Every execution ends with exactly one `Status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Out(String),
    Err(String),
    Status(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum PipeEvent {
    Data(Pipe, Vec<u8>),
    Closed(Pipe),
}

/// Run `command` through `bash -lc` inside `workdir`.
///
/// The child gets a null stdin and its own process group, so a timeout or a
/// drop takes down everything it started.
pub fn execute(
    command: &str,
    workdir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandExecution, ExecError> {
    let mut builder = Command::new("bash");
    builder
        .arg("-lc")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        builder.process_group(0);
    }

    let mut child = builder.spawn().map_err(|source| ExecError::Spawn {
        workdir: workdir.to_path_buf(),
        source,
    })?;
    tracing::debug!(pid = child.id(), ?timeout, "command started");

    let (sender, events) = mpsc::channel();
    let mut open_streams = 0;
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(Pipe::Stdout, stdout, sender.clone());
        open_streams += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(Pipe::Stderr, stderr, sender);
        open_streams += 1;
    }

    Ok(CommandExecution {
        child: Some(child),
        events,
        open_streams,
        stdout: Utf8Accumulator::default(),
        stderr: Utf8Accumulator::default(),
        deadline: timeout.map(|timeout| Instant::now() + timeout),
        timed_out: false,
        finished: false,
    })
}

fn spawn_reader(pipe: Pipe, mut source: impl Read + Send + 'static, sender: Sender<PipeEvent>) {
    let name = match pipe {
        Pipe::Stdout => "shellmate-stdout",
        Pipe::Stderr => "shellmate-stderr",
    };
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut buffer = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    if sender.send(PipeEvent::Data(pipe, buffer[..read].to_vec())).is_err() {
                        return;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::debug!(?pipe, %error, "pipe read failed");
                    break;
                }
            }
        }
        let _ = sender.send(PipeEvent::Closed(pipe));
    });
    if let Err(error) = spawned {
        tracing::warn!(?pipe, %error, "failed to spawn pipe reader");
    }
}

/// A running command. Iterating yields its output as it is produced; dropping
/// it early kills and reaps the process.
#[derive(Debug)]
pub struct CommandExecution {
    child: Option<Child>,
    events: Receiver<PipeEvent>,
    open_streams: usize,
    stdout: Utf8Accumulator,
    stderr: Utf8Accumulator,
    deadline: Option<Instant>,
    timed_out: bool,
    finished: bool,
}

impl CommandExecution {
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    fn next_event(&mut self) -> Result<PipeEvent, RecvTimeoutError> {
        match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(RecvTimeoutError::Timeout);
                }
                self.events.recv_timeout(remaining)
            }
            None => self
                .events
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        }
    }

    fn output(&mut self, pipe: Pipe, bytes: &[u8]) -> Option<ExecOutput> {
        let text = match pipe {
            Pipe::Stdout => self.stdout.push(bytes),
            Pipe::Stderr => self.stderr.push(bytes),
        };
        wrap_output(pipe, text)
    }

    fn close(&mut self, pipe: Pipe) -> Option<ExecOutput> {
        self.open_streams = self.open_streams.saturating_sub(1);
        let text = match pipe {
            Pipe::Stdout => self.stdout.finish(),
            Pipe::Stderr => self.stderr.finish(),
        };
        wrap_output(pipe, text)
    }

    /// Both streams are closed: wait for the exit status within the deadline.
    fn final_status(&mut self) -> ExecOutput {
        self.finished = true;
        let Some(mut child) = self.child.take() else {
            return ExecOutput::Status(UNKNOWN_EXIT_CODE);
        };

        let waited = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                child.wait_timeout(remaining)
            }
            None => child.wait().map(Some),
        };
        let status = match waited {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                self.timed_out = true;
                tracing::info!(pid = child.id(), "command timed out after closing its output");
                kill_and_wait(&mut child)
            }
            Err(error) => {
                tracing::warn!(pid = child.id(), %error, "waiting for command failed");
                kill_and_wait(&mut child)
            }
        };
        ExecOutput::Status(status.map_or(UNKNOWN_EXIT_CODE, exit_code))
    }

    /// Deadline hit while output was still open. The reader threads end once
    /// the process group is gone; they are not joined.
    fn kill_on_timeout(&mut self) -> ExecOutput {
        self.finished = true;
        self.timed_out = true;
        let Some(mut child) = self.child.take() else {
            return ExecOutput::Status(UNKNOWN_EXIT_CODE);
        };
        tracing::info!(pid = child.id(), "command timed out; killing process group");
        let status = kill_and_wait(&mut child);
        ExecOutput::Status(status.map_or(UNKNOWN_EXIT_CODE, exit_code))
    }
}

impl Iterator for CommandExecution {
    type Item = ExecOutput;

    fn next(&mut self) -> Option<ExecOutput> {
        if self.finished {
            return None;
        }
        loop {
            if self.open_streams == 0 {
                return Some(self.final_status());
            }
            match self.next_event() {
                Ok(PipeEvent::Data(pipe, bytes)) => {
                    if let Some(output) = self.output(pipe, &bytes) {
                        return Some(output);
                    }
                }
                Ok(PipeEvent::Closed(pipe)) => {
                    if let Some(output) = self.close(pipe) {
                        return Some(output);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Some(self.kill_on_timeout()),
                Err(RecvTimeoutError::Disconnected) => self.open_streams = 0,
            }
        }
    }
}

impl Drop for CommandExecution {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            tracing::debug!(pid = child.id(), "killing unfinished command");
            let _ = kill_and_wait(&mut child);
        }
    }
}

fn wrap_output(pipe: Pipe, text: String) -> Option<ExecOutput> {
    if text.is_empty() {
        return None;
    }
    Some(match pipe {
        Pipe::Stdout => ExecOutput::Out(text),
        Pipe::Stderr => ExecOutput::Err(text),
    })
}

fn kill_and_wait(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Ok(pid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal; the group was created for
            // this child by `process_group(0)`.
            unsafe {
                libc::killpg(pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    match child.wait() {
        Ok(status) => Some(status),
        Err(error) => {
            tracing::warn!(pid = child.id(), %error, "failed to reap killed command");
            None
        }
    }
}

/// Exit code, or `128 + signal` for a signalled process on unix.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

/// Incremental UTF-8 decoding of one pipe. A character split across reads is
/// held until its remaining bytes arrive; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(error) => {
                    let valid = error.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match error.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
