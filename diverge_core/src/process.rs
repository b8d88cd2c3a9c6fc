use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// How often a running child is polled for exit while waiting on its deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long output pipes may stay open after the command has been reaped.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

pub const SOURCE_PLACEHOLDER: &str = "{source}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";
pub const OPT_PLACEHOLDER: &str = "{opt}";
/// Expands to zero or more arguments; only recognized as a whole argument.
pub const FLAGS_PLACEHOLDER: &str = "{flags}";

/// Errors raised when an external command could not be run at all.
///
/// A command that runs and exits non-zero is *not* an error: the exit code is
/// returned as data in [`ProcessOutput`] and callers decide its significance.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Required tool '{program}' is not available")]
    ToolingUnavailable { program: String },
    #[error("Failed to spawn command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A single external command invocation with its wall-clock budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl ProcessRequest {
    /// Builds a request from a full argument vector; the first element is the program.
    pub fn from_argv(argv: Vec<String>, timeout: Duration) -> Self {
        let mut parts = argv.into_iter();
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
            timeout,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    /// True when the process exited on its own with status zero.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn describe_exit(&self) -> String {
        if self.timed_out {
            format!("Timed out after {:.2?}", self.duration)
        } else if let Some(code) = self.exit_code {
            format!("Exited with code {code}")
        } else if let Some(signal) = self.signal {
            format!("Terminated by signal {signal}")
        } else {
            "Exited abnormally".to_string()
        }
    }
}

/// Runs external commands under a deadline.
///
/// This is the only seam through which the campaign touches the outside
/// world, so tests substitute a scripted implementation.
pub trait ProcessRunner {
    /// Runs `request` to completion or until its timeout expires.
    ///
    /// On expiry the process (and, on Unix, its whole process group) is killed
    /// and the output captured so far is returned with `timed_out = true`.
    /// On Linux no member of the child's process group outlives this call.
    fn run(&mut self, request: &ProcessRequest) -> Result<ProcessOutput, RunError>;

    /// Whether `program` can be launched at all.
    fn is_available(&self, program: &str) -> bool;
}

/// [`ProcessRunner`] backed by real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }
}

impl ProcessRunner for SystemRunner {
    fn run(&mut self, request: &ProcessRequest) -> Result<ProcessOutput, RunError> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &request.working_dir {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout kill also reaches grandchildren
            // and terminal signals aimed at the campaign do not interrupt it.
            cmd.process_group(0);
        }

        debug!(command = %request.command_line(), timeout = ?request.timeout, "Spawning");
        let started = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(&request.program, e))?;
        let mut guard = ChildGuard::new(child);

        let stdout_reader = guard.take_stdout().map(spawn_reader);
        let stderr_reader = guard.take_stderr().map(spawn_reader);

        let exited = wait_with_deadline(&mut guard, request.timeout).map_err(|source| {
            RunError::Wait {
                program: request.program.clone(),
                source,
            }
        })?;
        let timed_out = !exited;
        if timed_out {
            warn!(command = %request.program, timeout = ?request.timeout, "Command timed out, killing");
        }
        // Lingering group members are killed along with the leader, before
        // the leader is reaped.
        let status = guard.terminate();

        // A descendant that left the group may still hold the pipes open.
        let drain_deadline = Instant::now() + PIPE_DRAIN_GRACE;
        let mut output = ProcessOutput {
            stdout: drain_reader(stdout_reader, drain_deadline),
            stderr: drain_reader(stderr_reader, drain_deadline),
            timed_out,
            duration: started.elapsed(),
            ..ProcessOutput::default()
        };
        if let Some(status) = status {
            output.exit_code = if timed_out { None } else { status.code() };
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                output.signal = status.signal();
            }
        }
        Ok(output)
    }

    fn is_available(&self, program: &str) -> bool {
        resolve_program(program).is_some()
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> RunError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RunError::ToolingUnavailable {
            program: program.to_string(),
        }
    } else {
        RunError::Spawn {
            program: program.to_string(),
            source: err,
        }
    }
}

/// Owns a spawned child and guarantees it is killed and reaped on every exit
/// path, including early returns and unwinding.
struct ChildGuard {
    child: Child,
    reaped: Option<ExitStatus>,
    terminated: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: None,
            terminated: false,
        }
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Whether the child has exited.
    ///
    /// On Linux the child is left unreaped, so its pid, and with it the
    /// process group id, cannot be reused before [`ChildGuard::terminate`]
    /// has signalled the group.
    #[cfg(target_os = "linux")]
    fn has_exited(&mut self) -> std::io::Result<bool> {
        let pid = libc::id_t::from(self.child.id());
        // SAFETY: an all-zero siginfo_t is a valid value.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is valid for writes for the duration of the call.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: with WNOHANG, si_pid is zero unless the child changed state.
        Ok(unsafe { info.si_pid() } != 0)
    }

    #[cfg(not(target_os = "linux"))]
    fn has_exited(&mut self) -> std::io::Result<bool> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = status;
        }
        Ok(status.is_some())
    }

    /// Kills whatever is left of the child and returns its final status.
    fn terminate(&mut self) -> Option<ExitStatus> {
        if self.terminated {
            return self.reaped;
        }
        self.terminated = true;
        if self.reaped.is_none() {
            // The unreaped leader keeps the group id reserved, so the signal
            // cannot reach an unrelated group.
            #[cfg(unix)]
            kill_process_group(self.child.id());
            if let Err(e) = self.child.kill() {
                debug!("Failed to kill child process: {e}");
            }
            self.reaped = self.child.wait().ok();
        }
        self.reaped
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. Callers only signal
    // groups whose leader has not been reaped yet.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Returns `Ok(false)` when the deadline passed before the child exited.
fn wait_with_deadline(guard: &mut ChildGuard, timeout: Duration) -> std::io::Result<bool> {
    let start_time = Instant::now();
    loop {
        if guard.has_exited()? {
            return Ok(true);
        }
        if start_time.elapsed() >= timeout {
            return Ok(false);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

/// Collects a reader's output until its pipe closes or `deadline` passes.
/// A reader still blocked at the deadline is abandoned with what it read.
fn drain_reader(reader: Option<Receiver<Vec<u8>>>, deadline: Instant) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(reader) = reader else {
        return buf;
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match reader.recv_timeout(remaining) {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Output pipe still open after the command ended, abandoning it");
                break;
            }
        }
    }
    buf
}

/// Resolves `program` the way the OS would when spawning it: paths are
/// checked directly, bare names are searched on `PATH`.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let path = Path::new(program);
    if path.components().count() > 1 {
        return is_executable(path).then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// An argument-vector command with `{placeholder}` substitution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    pub fn contains(&self, placeholder: &str) -> bool {
        self.argv.iter().any(|arg| arg.contains(placeholder))
    }

    /// Substitutes `vars` into every argument and splices `flags` in place of
    /// a `{flags}` argument, or appends them when there is none.
    pub fn render(&self, vars: &[(&str, &str)], flags: &[String]) -> Vec<String> {
        let mut rendered = Vec::with_capacity(self.argv.len() + flags.len());
        let mut spliced = false;
        for arg in &self.argv {
            if arg == FLAGS_PLACEHOLDER {
                rendered.extend(flags.iter().cloned());
                spliced = true;
                continue;
            }
            let mut value = arg.clone();
            for (placeholder, replacement) in vars {
                value = value.replace(placeholder, replacement);
            }
            rendered.push(value);
        }
        if !spliced {
            rendered.extend(flags.iter().cloned());
        }
        rendered
    }
}

impl From<Vec<String>> for CommandTemplate {
    fn from(argv: Vec<String>) -> Self {
        Self::new(argv)
    }
}


#[cfg(all(test, unix))]
mod system_runner_tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessRequest {
        ProcessRequest::from_argv(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        )
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let mut runner = SystemRunner::new();
        let output = runner
            .run(&sh("echo out; echo err >&2; exit 3", Duration::from_secs(5)))
            .unwrap();
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.timed_out);
        assert!(!output.success());
        assert_eq!(output.describe_exit(), "Exited with code 3");
    }

    #[test]
    fn successful_command_reports_success() {
        let mut runner = SystemRunner::new();
        let output = runner
            .run(&sh("printf checksum", Duration::from_secs(5)))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"checksum");
    }

    #[test]
    fn sleeping_command_times_out_within_bounded_overhead() {
        let mut runner = SystemRunner::new();
        let started = Instant::now();
        let output = runner
            .run(&sh("echo partial; sleep 5", Duration::from_millis(200)))
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        assert_eq!(output.exit_code, None);
        assert_eq!(output.stdout, b"partial\n");
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "runner blocked for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn timeout_kills_background_grandchildren() {
        let mut runner = SystemRunner::new();
        let started = Instant::now();
        let output = runner
            .run(&sh("sleep 5 & sleep 5", Duration::from_millis(200)))
            .unwrap();
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn background_child_of_finished_command_is_killed() {
        let mut runner = SystemRunner::new();
        let output = runner
            .run(&sh("sleep 30 & echo $!", Duration::from_secs(5)))
            .unwrap();
        assert!(output.success());
        let stdout = String::from_utf8(output.stdout).unwrap();
        let pid = stdout.trim();
        let deadline = Instant::now() + Duration::from_secs(3);
        while is_running(pid) && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        assert!(!is_running(pid), "background sleep {pid} survived");
    }

    #[test]
    fn escaped_descendant_holding_pipes_does_not_block() {
        if resolve_program("setsid").is_none() {
            return;
        }
        let mut runner = SystemRunner::new();
        let started = Instant::now();
        let output = runner
            .run(&sh("setsid sleep 10 & echo done", Duration::from_secs(5)))
            .unwrap();
        assert!(!output.timed_out);
        assert_eq!(output.stdout, b"done\n");
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "runner blocked for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn signal_death_is_reported() {
        let mut runner = SystemRunner::new();
        let output = runner
            .run(&sh("kill -SEGV $$", Duration::from_secs(5)))
            .unwrap();
        assert_eq!(output.exit_code, None);
        assert_eq!(output.signal, Some(libc::SIGSEGV));
        assert!(output.describe_exit().contains("signal"));
    }

    #[test]
    fn missing_program_is_tooling_unavailable() {
        let mut runner = SystemRunner::new();
        let request = ProcessRequest::from_argv(
            vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            Duration::from_secs(1),
        );
        match runner.run(&request) {
            Err(RunError::ToolingUnavailable { program }) => {
                assert!(program.contains("this_command_does_not_exist"));
            }
            other => panic!("Expected ToolingUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn working_dir_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = SystemRunner::new();
        let output = runner
            .run(&sh("pwd", Duration::from_secs(5)).with_working_dir(dir.path()))
            .unwrap();
        let printed = String::from_utf8(output.stdout).unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(printed.trim()).canonicalize().unwrap(), expected);
    }

    #[test]
    fn resolves_programs_on_path_and_by_location() {
        assert!(resolve_program("sh").is_some());
        assert!(resolve_program("this_command_does_not_exist_ever_12345").is_none());
        assert!(resolve_program("").is_none());
        assert!(resolve_program("/definitely/not/here").is_none());
        let runner = SystemRunner::new();
        assert!(runner.is_available("sh"));
    }
}
