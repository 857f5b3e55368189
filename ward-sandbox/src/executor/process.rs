//! Short-lived interpreter process under OS resource limits

use super::runner::IMPORT_GUARD_MARKER;
use super::sealed::Strategy;
use super::workspace::{Workspace, POLICY_FILE, PROGRAM_FILE, RESULT_FILE, RUNNER_FILE};
use super::{Collaborators, Dispatch, Outcome};
use crate::config::SandboxConfiguration;
use crate::monitor::{breach_of, MonitorLimits, MonitorTarget, ProcessTarget, ResourceMonitor};
use crate::policy::ExecutionStrategy;
use crate::types::{
    duration_ms, CapturedOutput, ExecutionError, ResourceBreach, ResourceKind, ResourceUsage,
    SecurityViolation, ViolationKind,
};
use async_trait::async_trait;
use serde_json::json;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to wait for output pipes to drain once the process is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default strategy for untrusted input
#[derive(Debug, Clone, Default)]
pub struct IsolatedProcessExecutor {
    collaborators: Collaborators,
}

impl IsolatedProcessExecutor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

/// Limits applied in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    cpu_seconds: u64,
    address_space: u64,
    open_files: u64,
    processes: Option<u64>,
    unshare_network: bool,
}

impl ChildLimits {
    fn from_config(config: &SandboxConfiguration) -> Self {
        Self {
            cpu_seconds: config.limits.cpu_seconds(),
            address_space: config.limits.max_memory,
            open_files: config.limits.max_open_files,
            processes: config.limits.max_processes,
            unshare_network: !config.allow_network && config.isolated_process.unshare_network,
        }
    }

    /// Runs in the forked child: only async-signal-safe calls
    fn apply(&self) -> io::Result<()> {
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
        set_rlimit(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        set_rlimit(libc::RLIMIT_AS, self.address_space, self.address_space)?;
        set_rlimit(libc::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        if let Some(processes) = self.processes {
            set_rlimit(libc::RLIMIT_NPROC, processes, processes)?;
        }
        if self.unshare_network {
            // best-effort; unprivileged user namespaces may be disabled
            // SAFETY: unshare only affects the calling (child) process
            unsafe {
                libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET);
            }
        }
        Ok(())
    }
}

fn set_rlimit(resource: RlimitResource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Look a program up the way a shell would
pub(crate) fn resolve_program(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Bytes read from one output stream, capped
#[derive(Debug, Default)]
pub(super) struct Captured {
    pub text: String,
    pub truncated: bool,
}

/// Read `reader` to the end, keeping at most `cap` bytes
pub(super) async fn capture<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Captured {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    Captured {
        text: String::from_utf8_lossy(&kept).into_owned(),
        truncated,
    }
}

pub(super) async fn collect(task: Option<JoinHandle<Captured>>) -> Captured {
    let Some(task) = task else {
        return Captured::default();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(err)) => {
            warn!("Output capture task failed: {}", err);
            Captured::default()
        }
        Err(_) => {
            debug!("Output pipe still open after exit, dropping it");
            Captured::default()
        }
    }
}

/// Why the wait for the program ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum Ending {
    Exited,
    TimedOut,
    Cancelled,
    Breached(ResourceBreach),
}

/// Everything observed about a finished process
#[derive(Debug)]
pub(super) struct Finished {
    pub ending: Ending,
    pub status: Option<ExitStatus>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub usage: ResourceUsage,
}

/// Turn a finished process into output plus an optional error
pub(super) fn classify(
    finished: Finished,
    config: &SandboxConfiguration,
    workspace: &Workspace,
) -> Outcome {
    let Finished {
        ending,
        status,
        stdout,
        stderr,
        usage,
    } = finished;

    let mut output = CapturedOutput {
        stdout: stdout.text,
        stderr: stderr.text,
        exit_code: status.and_then(exit_code),
        resource_usage: usage,
        ..Default::default()
    };
    for (name, captured) in [("stdout", stdout.truncated), ("stderr", stderr.truncated)] {
        if captured {
            output.warnings.push(format!(
                "{} truncated to {} bytes",
                name, config.max_output_bytes
            ));
        }
    }

    let breach = match ending {
        Ending::Cancelled => return Outcome::failure(ExecutionError::terminated(), output),
        Ending::TimedOut => {
            let limit = config.limits.max_execution_time;
            output.violations.push(SecurityViolation::timeout(limit));
            return Outcome::failure(ExecutionError::timeout(limit), output);
        }
        Ending::Breached(breach) => Some(breach),
        Ending::Exited => exit_breach(status, &output, config),
    };
    if let Some(breach) = breach {
        output.violations.push(SecurityViolation::resource_exceeded(&breach));
        return Outcome::failure(ExecutionError::resource_exceeded(&breach), output);
    }

    match status {
        Some(status) if status.success() => {
            output.return_value = workspace.read_return_value();
            Outcome::success(output)
        }
        Some(status) => {
            let last = last_line(&output.stderr).unwrap_or_default().to_string();
            if let Some(module) = blocked_import(&last) {
                output.violations.push(
                    SecurityViolation::new(
                        ViolationKind::ForbiddenImport,
                        format!("import of '{}' was blocked at runtime", module),
                    )
                    .with_detail(json!({ "module": module })),
                );
            }
            let message = if last.is_empty() {
                format!("process exited with {}", status)
            } else {
                last
            };
            Outcome::failure(ExecutionError::runtime(message), output)
        }
        None => Outcome::failure(
            ExecutionError::infrastructure("lost track of the sandboxed process"),
            output,
        ),
    }
}

/// Resource ceilings reported by the exit status or the interpreter itself
fn exit_breach(
    status: Option<ExitStatus>,
    output: &CapturedOutput,
    config: &SandboxConfiguration,
) -> Option<ResourceBreach> {
    let status = status?;
    if status.success() {
        return None;
    }
    let limits = &config.limits;
    let usage = &output.resource_usage;

    if status.signal() == Some(libc::SIGXCPU) {
        let limit = duration_ms(limits.max_cpu_time);
        return Some(ResourceBreach::new(
            ResourceKind::CpuTime,
            limit,
            usage.cpu_time_ms.max(limit),
        ));
    }

    let last = last_line(&output.stderr)?;
    if last == "MemoryError" || last.starts_with("MemoryError:") {
        return Some(ResourceBreach::new(
            ResourceKind::Memory,
            limits.max_memory,
            usage.memory.peak.max(limits.max_memory),
        ));
    }
    if last.contains("Too many open files") {
        return Some(ResourceBreach::new(
            ResourceKind::FileDescriptors,
            limits.max_open_files,
            usage.open_files.peak.max(limits.max_open_files),
        ));
    }
    None
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

/// Module named by the runner's import guard
fn blocked_import(line: &str) -> Option<String> {
    if !line.starts_with("ImportError") || !line.contains(IMPORT_GUARD_MARKER) {
        return None;
    }
    let quoted = line.split('\'').nth(1).unwrap_or(".");
    Some(quoted.to_string())
}

/// Exit code, or 128 + signal for a signalled process
fn exit_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

/// SIGKILL the whole process group led by `pid`
pub(super) fn kill_group(pid: u32) {
    ProcessTarget::new(pid).with_process_group().terminate();
}

#[async_trait]
impl Strategy for IsolatedProcessExecutor {
    fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    fn kind(&self) -> ExecutionStrategy {
        ExecutionStrategy::IsolatedProcess
    }

    async fn dispatch(&self, run: Dispatch<'_>) -> Outcome {
        let config = run.config;
        let settings = &config.isolated_process;

        let workspace = match Workspace::create(run.source, config) {
            Ok(workspace) => workspace,
            Err(err) => {
                return Outcome::failure(
                    ExecutionError::infrastructure(format!("failed to prepare workspace: {}", err)),
                    CapturedOutput::default(),
                )
            }
        };
        let Some(interpreter) = resolve_program(&settings.interpreter) else {
            return Outcome::failure(
                ExecutionError::infrastructure(format!(
                    "interpreter '{}' not found",
                    settings.interpreter
                )),
                CapturedOutput::default(),
            );
        };

        let mut command = Command::new(&interpreter);
        command
            .arg("-I")
            .args(&settings.args)
            .arg(workspace.file(RUNNER_FILE))
            .arg(workspace.file(PROGRAM_FILE))
            .arg(workspace.file(RESULT_FILE))
            .arg(workspace.file(POLICY_FILE))
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .envs(&run.context.environment)
            .current_dir(
                run.context
                    .working_directory
                    .as_deref()
                    .unwrap_or(workspace.path()),
            )
            .stdin(if run.context.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let limits = ChildLimits::from_config(config);
        // SAFETY: `apply` only calls setrlimit and unshare, both async-signal-safe
        unsafe {
            command.pre_exec(move || limits.apply());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Outcome::failure(
                    ExecutionError::infrastructure(format!(
                        "failed to spawn {}: {}",
                        interpreter.display(),
                        err
                    )),
                    CapturedOutput::default(),
                )
            }
        };
        let Some(pid) = child.id() else {
            return Outcome::failure(
                ExecutionError::infrastructure("sandboxed process exited before it was observed"),
                CapturedOutput::default(),
            );
        };
        debug!(
            execution_id = %run.context.execution_id,
            pid,
            interpreter = %interpreter.display(),
            "Spawned sandboxed process"
        );

        if let (Some(input), Some(mut stdin)) = (run.context.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(input.as_bytes()).await {
                    debug!("Writing program input failed: {}", err);
                }
            });
        }
        let cap = config.max_output_bytes;
        let stdout = child.stdout.take().map(|pipe| tokio::spawn(capture(pipe, cap)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(capture(pipe, cap)));

        let mut monitor = None;
        if config.enable_runtime_monitoring {
            let mut started = ResourceMonitor::new(MonitorLimits::from_config(config));
            let target = ProcessTarget::new(pid).with_process_group();
            match started.start_monitoring(Arc::new(target)) {
                Ok(()) => monitor = Some(started),
                Err(err) => warn!("Failed to start resource monitor: {}", err),
            }
        }
        let mut breach_signal = monitor.as_ref().map(ResourceMonitor::breach_signal);

        let mut status = None;
        let ending = tokio::select! {
            result = child.wait() => {
                status = result.ok();
                Ending::Exited
            }
            _ = tokio::time::sleep_until(run.deadline) => Ending::TimedOut,
            _ = run.cancel.cancelled() => Ending::Cancelled,
            breach = breach_of(&mut breach_signal) => Ending::Breached(breach),
        };
        if ending != Ending::Exited {
            debug!(execution_id = %run.context.execution_id, ?ending, "Stopping sandboxed process");
        }
        // also reaps anything the program left behind in its group
        kill_group(pid);
        if status.is_none() {
            status = child.wait().await.ok();
        }

        let usage = match monitor.as_mut() {
            Some(monitor) => monitor.stop_monitoring().await,
            None => ResourceUsage::default(),
        };
        let finished = Finished {
            ending,
            status,
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
            usage,
        };
        classify(finished, config, &workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionContext;
    use crate::executor::SandboxExecutor;
    use crate::types::ErrorKind;
    use tokio_util::sync::CancellationToken;
    use ward_common::{AllowAll, NullAuditSink};

    fn executor() -> IsolatedProcessExecutor {
        IsolatedProcessExecutor::new(Collaborators::new(
            Arc::new(AllowAll),
            Arc::new(NullAuditSink),
        ))
    }

    fn python_available() -> bool {
        resolve_program("python3").is_some()
    }

    fn finished(ending: Ending, status: Option<ExitStatus>, stderr: &str) -> Finished {
        Finished {
            ending,
            status,
            stdout: Captured::default(),
            stderr: Captured {
                text: stderr.to_string(),
                truncated: false,
            },
            usage: ResourceUsage::default(),
        }
    }

    fn exited(code: i32) -> Option<ExitStatus> {
        Some(ExitStatus::from_raw(code << 8))
    }

    #[test]
    fn test_classify_exit_statuses() {
        let config = SandboxConfiguration::strict();
        let workspace = Workspace::create("", &config).unwrap();

        let outcome = classify(finished(Ending::Exited, exited(0), ""), &config, &workspace);
        assert!(outcome.error.is_none());

        let outcome = classify(
            finished(Ending::Exited, Some(ExitStatus::from_raw(libc::SIGXCPU)), ""),
            &config,
            &workspace,
        );
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ResourceExceeded);
        assert_eq!(error.detail.unwrap()["resource"], "cpu-time");
        assert_eq!(outcome.output.exit_code, Some(128 + libc::SIGXCPU));

        let traceback = "Traceback (most recent call last):\n  File \"<sandbox>\", line 1\nMemoryError\n";
        let outcome = classify(finished(Ending::Exited, exited(1), traceback), &config, &workspace);
        assert_eq!(outcome.error.unwrap().detail.unwrap()["resource"], "memory");

        let traceback = "OSError: [Errno 24] Too many open files: 'x'\n";
        let outcome = classify(finished(Ending::Exited, exited(1), traceback), &config, &workspace);
        assert_eq!(
            outcome.error.unwrap().detail.unwrap()["resource"],
            "file-descriptors"
        );

        let outcome = classify(
            finished(Ending::Exited, exited(1), "ValueError: bad\n"),
            &config,
            &workspace,
        );
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RuntimeError);
        assert_eq!(error.message, "ValueError: bad");
    }

    #[test]
    fn test_classify_blocked_import() {
        let config = SandboxConfiguration::strict();
        let workspace = Workspace::create("", &config).unwrap();
        let stderr = "ImportError: import of 'socket' is blocked in the sandbox\n";
        let outcome = classify(finished(Ending::Exited, exited(1), stderr), &config, &workspace);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::RuntimeError);
        assert_eq!(outcome.output.violations.len(), 1);
        assert_eq!(outcome.output.violations[0].kind, ViolationKind::ForbiddenImport);
        assert_eq!(outcome.output.violations[0].detail["module"], "socket");
    }

    #[test]
    fn test_classify_endings_win_over_status() {
        let config = SandboxConfiguration::strict();
        let workspace = Workspace::create("", &config).unwrap();
        let outcome = classify(finished(Ending::TimedOut, None, ""), &config, &workspace);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Timeout);
        let outcome = classify(finished(Ending::Cancelled, None, ""), &config, &workspace);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Terminated);
    }

    #[test]
    fn test_resolve_program() {
        assert!(resolve_program("definitely-not-a-real-binary-ward").is_none());
        assert!(resolve_program("/definitely/not/here").is_none());
    }

    #[tokio::test]
    async fn test_return_value_and_output() {
        if !python_available() {
            return;
        }
        let source = "total = sum(range(5))\nprint('total', total)\ntotal * 2\n";
        let result = executor()
            .execute(source, &ExecutionContext::new(), &SandboxConfiguration::strict())
            .await;
        assert!(result.is_success(), "{:?}", result.error_message());
        assert_eq!(result.stdout(), "total 10\n");
        assert_eq!(result.return_value(), Some(&json!(20)));
        assert_eq!(result.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_stdin_and_environment() {
        if !python_available() {
            return;
        }
        let context = ExecutionContext::new().with_stdin("hello\n");
        let source = "import sys\nsys.stdin.readline().strip().upper()\n";
        let config = SandboxConfiguration::restricted()
            .with_forbidden_imports(Vec::<String>::new());
        let result = executor().execute(source, &context, &config).await;
        assert!(result.is_success(), "{:?}", result.error_message());
        assert_eq!(result.return_value(), Some(&json!("HELLO")));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        if !python_available() {
            return;
        }
        let config = SandboxConfiguration::strict()
            .with_max_execution_time(Duration::from_millis(500));
        let result = executor()
            .execute("while True:\n    pass\n", &ExecutionContext::new(), &config)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(result.execution_time() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_memory_ceiling() {
        if !python_available() {
            return;
        }
        let result = executor()
            .execute(
                "data = bytearray(1024 * 1024 * 1024)\n",
                &ExecutionContext::new(),
                &SandboxConfiguration::strict(),
            )
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExceeded));
        assert_eq!(result.resource_kind(), Some(ResourceKind::Memory));
    }

    #[tokio::test]
    async fn test_runtime_import_guard() {
        if !python_available() {
            return;
        }
        let config = SandboxConfiguration::strict().with_static_analysis(false);
        let result = executor()
            .execute("import socket\n", &ExecutionContext::new(), &config)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
        assert_eq!(result.violations()[0].kind, ViolationKind::ForbiddenImport);
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        if !python_available() {
            return;
        }
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let result = executor()
            .execute_with_cancel(
                "while True:\n    pass\n",
                &ExecutionContext::new(),
                &SandboxConfiguration::restricted(),
                cancel,
            )
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Terminated));
    }
}
