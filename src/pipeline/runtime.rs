use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;
pub const TIMEOUT_EXIT_CODE: i32 = 124;
pub const SIGNALED_EXIT_CODE: i32 = -1;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
// Descendants can hold the pipes open after the child is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn with_program(&self, program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(status_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 0
    }

    fn spawn_failure(program: &str, error: &std::io::Error) -> Self {
        let stderr = if error.kind() == ErrorKind::NotFound {
            format!("{program}: command not found")
        } else {
            format!("{program}: failed to start: {error}")
        };
        Self::failure(SPAWN_FAILURE_EXIT_CODE, stderr)
    }
}

pub trait PipelineCommandRunner: Send + Sync + 'static {
    fn run(&self, spec: &CommandSpec) -> CommandOutput;
}

impl<R> PipelineCommandRunner for Arc<R>
where
    R: PipelineCommandRunner + ?Sized,
{
    fn run(&self, spec: &CommandSpec) -> CommandOutput {
        self.as_ref().run(spec)
    }
}

#[derive(Debug, Default, Clone)]
pub struct StdPipelineCommandRunner {
    timeout: Option<Duration>,
}

impl StdPipelineCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl PipelineCommandRunner for StdPipelineCommandRunner {
    fn run(&self, spec: &CommandSpec) -> CommandOutput {
        let mut command = Command::new(spec.program.as_str());
        command
            .args(spec.args.iter().map(String::as_str))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = spec.cwd.as_deref() {
            command.current_dir(cwd);
        }

        debug!(program = %spec.program, args = ?spec.args, "spawning external command");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => return CommandOutput::spawn_failure(spec.program.as_str(), &error),
        };

        let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
        let stderr_reader = child.stderr.take().map(spawn_pipe_reader);
        let waited = wait_with_deadline(&mut child, self.timeout);
        let drain_deadline = self.timeout.map(|_| Instant::now() + PIPE_DRAIN_GRACE);
        let stdout = collect_pipe(stdout_reader, drain_deadline);
        let mut stderr = collect_pipe(stderr_reader, drain_deadline);

        let status_code = match waited {
            WaitOutcome::Exited(status) => status.code().unwrap_or(SIGNALED_EXIT_CODE),
            WaitOutcome::TimedOut(limit) => {
                append_line(
                    &mut stderr,
                    format!("{}: timed out after {}s", spec.program, limit.as_secs_f32()).as_str(),
                );
                TIMEOUT_EXIT_CODE
            }
            WaitOutcome::WaitFailed(error) => {
                append_line(
                    &mut stderr,
                    format!("{}: wait failed: {error}", spec.program).as_str(),
                );
                SPAWN_FAILURE_EXIT_CODE
            }
        };

        CommandOutput {
            status_code,
            stdout,
            stderr,
        }
    }
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut(Duration),
    WaitFailed(std::io::Error),
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> WaitOutcome {
    let Some(limit) = timeout else {
        return match child.wait() {
            Ok(status) => WaitOutcome::Exited(status),
            Err(error) => WaitOutcome::WaitFailed(error),
        };
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) if started.elapsed() >= limit => {
                abandon_child(child);
                return WaitOutcome::TimedOut(limit);
            }
            Ok(None) => thread::sleep(WAIT_POLL_INTERVAL),
            Err(error) => {
                abandon_child(child);
                return WaitOutcome::WaitFailed(error);
            }
        }
    }
}

fn abandon_child(child: &mut Child) {
    if let Err(error) = child.kill() {
        debug!(pid = child.id(), error = %error, "kill of abandoned child failed");
    }
    let _ = child.wait();
}

fn spawn_pipe_reader<P>(mut pipe: P) -> Receiver<Vec<u8>>
where
    P: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn collect_pipe(reader: Option<Receiver<Vec<u8>>>, deadline: Option<Instant>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let bytes = match deadline {
        None => reader.recv().unwrap_or_default(),
        Some(deadline) => {
            match reader.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(bytes) => bytes,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("pipe still held open after exit, abandoning reader");
                    Vec::new()
                }
                Err(RecvTimeoutError::Disconnected) => Vec::new(),
            }
        }
    };
    String::from_utf8_lossy(bytes.as_slice()).to_string()
}

fn append_line(target: &mut String, line: &str) {
    if !target.is_empty() && !target.ends_with('\n') {
        target.push('\n');
    }
    target.push_str(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_is_reported_as_data() {
        let output = StdPipelineCommandRunner::new().run(&CommandSpec::new(
            "nano-banana-definitely-missing-tool",
            ["--version"],
        ));

        assert_eq!(output.status_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(!output.is_success());
        assert!(output.stdout.is_empty());
        assert_eq!(
            output.stderr,
            "nano-banana-definitely-missing-tool: command not found"
        );
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams_and_non_zero_exit() {
        let output = StdPipelineCommandRunner::new().run(&CommandSpec::new(
            "sh",
            ["-c", "printf out; printf err >&2; exit 3"],
        ));

        assert_eq!(output.status_code, 3);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
    }

    #[cfg(unix)]
    #[test]
    fn runs_in_requested_working_directory() {
        let cwd = std::env::temp_dir();
        let mut spec = CommandSpec::new("pwd", Vec::<String>::new());
        spec.cwd = Some(cwd.clone());

        let output = StdPipelineCommandRunner::new().run(&spec);

        assert!(output.is_success());
        let reported = std::fs::canonicalize(output.stdout.trim()).expect("pwd output is a path");
        let expected = std::fs::canonicalize(cwd).expect("temp dir should canonicalize");
        assert_eq!(reported, expected);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_child_and_reports_failure() {
        let runner =
            StdPipelineCommandRunner::new().with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();

        let output = runner.run(&CommandSpec::new("sleep", ["5"]));

        assert_eq!(output.status_code, TIMEOUT_EXIT_CODE);
        assert!(output.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_does_not_wait_for_descendants_holding_pipes() {
        let runner =
            StdPipelineCommandRunner::new().with_timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();

        let output = runner.run(&CommandSpec::new("sh", ["-c", "sleep 4; true"]));

        assert_eq!(output.status_code, TIMEOUT_EXIT_CODE);
        assert!(output.stderr.contains("timed out after"));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "run blocked for {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[test]
    fn abandoned_child_is_killed_and_reaped() {
        let mut child = Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("sleep should spawn");
        let started = Instant::now();

        abandon_child(&mut child);

        let status = child
            .try_wait()
            .expect("status should be readable")
            .expect("child should already be reaped");
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn bounded_runner_still_collects_output_of_quick_commands() {
        let runner = StdPipelineCommandRunner::new().with_timeout(Some(Duration::from_secs(10)));

        let output = runner.run(&CommandSpec::new("sh", ["-c", "printf done; printf warn >&2"]));

        assert!(output.is_success());
        assert_eq!(output.stdout, "done");
        assert_eq!(output.stderr, "warn");
    }

    #[test]
    fn with_program_keeps_arguments() {
        let spec = CommandSpec::new("magick", ["a.png", "-trim"]);
        let legacy = spec.with_program("convert");

        assert_eq!(legacy.program, "convert");
        assert_eq!(legacy.args, spec.args);
    }
}
