//! Disposable container per execution, driven through a docker-compatible CLI
//!
//! Ceilings are enforced by the container runtime (cgroup memory and CPU
//! quota, pids limit, ulimits), so no resource monitor is attached; an OOM
//! kill is read back from `inspect` after the container exits.

use super::process::{capture, classify, collect, resolve_program, Ending, Finished};
use super::sealed::Strategy;
use super::workspace::{Workspace, POLICY_FILE, PROGRAM_FILE, RESULT_FILE, RUNNER_FILE};
use super::{Collaborators, Dispatch, Outcome};
use crate::config::SandboxConfiguration;
use crate::execution::ExecutionContext;
use crate::policy::ExecutionStrategy;
use crate::types::{CapturedOutput, ExecutionError, ResourceBreach, ResourceKind, ResourceUsage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MOUNT_POINT: &str = "/sandbox";

/// Bound on `kill`, `inspect` and `rm` invocations
const CLI_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit codes the docker CLI uses for its own failures
const RUNTIME_FAILURE_CODES: std::ops::RangeInclusive<i32> = 125..=127;

/// Strongest isolation; requires a reachable container runtime
#[derive(Debug, Clone, Default)]
pub struct ContainerExecutor {
    collaborators: Collaborators,
}

impl ContainerExecutor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

/// Whether `<runtime> info` succeeds within `timeout`
pub(crate) async fn runtime_available(runtime: &str, timeout: Duration) -> bool {
    let Some(runtime) = resolve_program(runtime) else {
        return false;
    };
    let mut command = Command::new(runtime);
    command
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    matches!(
        tokio::time::timeout(timeout, command.status()).await,
        Ok(Ok(status)) if status.success()
    )
}

fn container_name(context: &ExecutionContext) -> String {
    format!("ward-{}", context.execution_id)
}

fn sandbox_path(file: &str) -> String {
    format!("{}/{}", MOUNT_POINT, file)
}

/// Arguments of `<runtime> run`
fn run_args(
    name: &str,
    config: &SandboxConfiguration,
    context: &ExecutionContext,
    workspace: &Path,
) -> Vec<String> {
    let settings = &config.container;
    let memory = config.container_memory_limit().to_string();
    let files = config.limits.max_open_files;
    let cpu = config.limits.cpu_seconds();

    let mut args: Vec<String> = vec![
        "run".into(),
        "--name".into(),
        name.into(),
        "--network".into(),
        if config.allow_network { "bridge" } else { "none" }.into(),
        "--read-only".into(),
        "--tmpfs".into(),
        "/tmp".into(),
        "--memory".into(),
        memory.clone(),
        "--memory-swap".into(),
        memory,
        "--cpus".into(),
        settings.cpu_limit.to_string(),
        "--pids-limit".into(),
        settings.pids_limit.to_string(),
        "--security-opt".into(),
        "no-new-privileges".into(),
    ];
    for option in &settings.security_opts {
        args.push("--security-opt".into());
        args.push(option.clone());
    }
    args.extend([
        "--cap-drop".into(),
        "ALL".into(),
        "--ulimit".into(),
        format!("nofile={}:{}", files, files),
        "--ulimit".into(),
        format!("cpu={}:{}", cpu, cpu + 1),
        "--mount".into(),
        format!(
            "type=bind,source={},target={}",
            workspace.display(),
            MOUNT_POINT
        ),
        "--workdir".into(),
        MOUNT_POINT.into(),
    ]);
    if context.stdin.is_some() {
        args.push("-i".into());
    }
    for (key, value) in &context.environment {
        args.push("--env".into());
        args.push(format!("{}={}", key, value));
    }
    args.extend([
        settings.image.clone(),
        settings.interpreter.clone(),
        "-I".into(),
        sandbox_path(RUNNER_FILE),
        sandbox_path(PROGRAM_FILE),
        sandbox_path(RESULT_FILE),
        sandbox_path(POLICY_FILE),
    ]);
    args
}

/// Run a short runtime CLI command, bounded by [`CLI_TIMEOUT`]
async fn runtime_cli(runtime: &Path, args: &[&str]) -> Option<std::process::Output> {
    let mut command = Command::new(runtime);
    command.args(args).stdin(Stdio::null()).kill_on_drop(true);
    let subcommand = args.first().copied().unwrap_or_default();
    match tokio::time::timeout(CLI_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(err)) => {
            warn!(command = subcommand, "Container runtime call failed: {}", err);
            None
        }
        Err(_) => {
            warn!(command = subcommand, "Container runtime call timed out");
            None
        }
    }
}

/// Removes the container if the dispatch future is dropped early
struct RemoveOnDrop {
    runtime: PathBuf,
    name: String,
    armed: bool,
}

impl RemoveOnDrop {
    async fn remove(mut self) {
        self.armed = false;
        match runtime_cli(&self.runtime, &["rm", "-f", &self.name]).await {
            Some(output) if output.status.success() => {
                debug!(container = %self.name, "Container removed")
            }
            _ => warn!(container = %self.name, "Failed to remove container"),
        }
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let runtime = self.runtime.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    runtime_cli(&runtime, &["rm", "-f", &name]).await;
                });
            }
            Err(_) => {
                let _ = std::process::Command::new(runtime)
                    .args(["rm", "-f", &name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
        }
    }
}

#[async_trait]
impl Strategy for ContainerExecutor {
    fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    fn kind(&self) -> ExecutionStrategy {
        ExecutionStrategy::Container
    }

    async fn dispatch(&self, run: Dispatch<'_>) -> Outcome {
        let config = run.config;
        let settings = &config.container;
        let Some(runtime) = resolve_program(&settings.runtime) else {
            return Outcome::failure(
                ExecutionError::infrastructure(format!(
                    "container runtime '{}' not found",
                    settings.runtime
                )),
                CapturedOutput::default(),
            );
        };
        let workspace = match Workspace::create(run.source, config) {
            Ok(workspace) => workspace,
            Err(err) => {
                return Outcome::failure(
                    ExecutionError::infrastructure(format!("failed to prepare workspace: {}", err)),
                    CapturedOutput::default(),
                )
            }
        };

        let name = container_name(run.context);
        let args = run_args(&name, config, run.context, workspace.path());
        let mut command = Command::new(&runtime);
        command
            .args(&args)
            .stdin(if run.context.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cleanup = RemoveOnDrop {
            runtime: runtime.clone(),
            name: name.clone(),
            armed: true,
        };
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                cleanup.remove().await;
                return Outcome::failure(
                    ExecutionError::infrastructure(format!(
                        "failed to start {}: {}",
                        runtime.display(),
                        err
                    )),
                    CapturedOutput::default(),
                );
            }
        };
        info!(
            execution_id = %run.context.execution_id,
            container = %name,
            image = %settings.image,
            "Started container"
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

        let mut status = None;
        let mut ending = tokio::select! {
            result = child.wait() => {
                status = result.ok();
                Ending::Exited
            }
            _ = tokio::time::sleep_until(run.deadline) => Ending::TimedOut,
            _ = run.cancel.cancelled() => Ending::Cancelled,
        };
        if ending != Ending::Exited {
            debug!(container = %name, ?ending, "Killing container");
            runtime_cli(&runtime, &["kill", &name]).await;
            status = child.wait().await.ok();
        }

        let inspect = ["inspect", "--format", "{{.State.OOMKilled}}", name.as_str()];
        let oom_killed = runtime_cli(&runtime, &inspect)
            .await
            .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "true")
            .unwrap_or(false);
        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;
        cleanup.remove().await;

        if ending == Ending::Exited {
            if oom_killed {
                let limit = config.container_memory_limit();
                ending = Ending::Breached(ResourceBreach::new(ResourceKind::Memory, limit, limit));
            } else if let Some(code) = status.and_then(|status| status.code()) {
                if RUNTIME_FAILURE_CODES.contains(&code) {
                    let reason = stderr
                        .text
                        .lines()
                        .rev()
                        .find(|line| !line.trim().is_empty())
                        .unwrap_or("container runtime failed")
                        .trim()
                        .to_string();
                    let output = CapturedOutput {
                        stderr: stderr.text,
                        exit_code: Some(code),
                        ..Default::default()
                    };
                    return Outcome::failure(ExecutionError::infrastructure(reason), output);
                }
            }
        }

        classify(
            Finished {
                ending,
                status,
                stdout,
                stderr,
                usage: ResourceUsage::default(),
            },
            config,
            &workspace,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], flag: &str) -> usize {
        args.iter().position(|arg| arg == flag).unwrap()
    }

    #[test]
    fn test_run_args_lock_down_the_container() {
        let config = SandboxConfiguration::strict().with_strategy(ExecutionStrategy::Container);
        let context = ExecutionContext::new().with_env("MODE", "test");
        let name = container_name(&context);
        let args = run_args(&name, &config, &context, Path::new("/tmp/ward-x"));

        assert_eq!(args[0], "run");
        assert_eq!(args[position(&args, "--name") + 1], name);
        assert_eq!(args[position(&args, "--network") + 1], "none");
        assert!(args.contains(&"--read-only".to_string()));
        assert_eq!(args[position(&args, "--cap-drop") + 1], "ALL");
        assert_eq!(
            args[position(&args, "--memory") + 1],
            config.container_memory_limit().to_string()
        );
        assert_eq!(args[position(&args, "--env") + 1], "MODE=test");
        assert!(args.contains(&"type=bind,source=/tmp/ward-x,target=/sandbox".to_string()));
        assert!(!args.contains(&"-i".to_string()));

        let image = position(&args, &config.container.image);
        assert_eq!(args[image + 1], "python3");
        assert_eq!(args[image + 3], "/sandbox/runner.py");
        assert_eq!(args.last().unwrap(), "/sandbox/policy.json");
    }

    #[test]
    fn test_run_args_network_and_stdin() {
        let config = SandboxConfiguration::permissive()
            .with_strategy(ExecutionStrategy::Container)
            .with_network(true);
        let context = ExecutionContext::new().with_stdin("data");
        let args = run_args("ward-test", &config, &context, Path::new("/w"));
        assert_eq!(args[position(&args, "--network") + 1], "bridge");
        assert!(args.contains(&"-i".to_string()));
    }

    #[test]
    fn test_name_derives_from_execution_id() {
        let context = ExecutionContext::new();
        assert_eq!(
            container_name(&context),
            format!("ward-{}", context.execution_id)
        );
    }

    #[tokio::test]
    async fn test_missing_runtime_is_unavailable() {
        assert!(!runtime_available("definitely-not-a-container-runtime", Duration::from_secs(1)).await);
    }
}
