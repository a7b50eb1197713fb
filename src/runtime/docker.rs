//! `docker` CLI adapter.
//!
//! Every operation spawns its own `docker` child process through
//! `tokio::process::Command`, so concurrent calls for different tasks share
//! nothing but the daemon.
//!
//! | Operation | Command |
//! |-----------|---------|
//! | start | `image inspect`, `pull` (if missing), `create`, `start` |
//! | await_completion | `wait` |
//! | terminate | `kill` |
//! | stream_output | `logs --follow` |

use std::io;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, OutputStream, WorkloadHandle};
use crate::constants::TASK_LABEL;
use crate::error::RuntimeError;
use crate::types::Task;

const READ_CHUNK: usize = 8 * 1024;

/// [`ContainerRuntime`] backed by the `docker` command-line client.
///
/// # Examples
///
/// ```
/// use cancelable_worker::runtime::DockerCli;
///
/// let docker = DockerCli::new().with_binary("podman");
/// assert_eq!(docker.binary(), "podman");
/// ```
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    /// Uses `docker` from `PATH`.
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Uses a different Docker-compatible binary.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// The binary invoked for every operation.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Runs one docker command to completion, returning trimmed stdout.
    async fn run(&self, operation: &'static str, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        check_output(operation, output)
    }

    fn spawn_error(&self, err: io::Error) -> RuntimeError {
        RuntimeError::Unreachable {
            message: format!("failed to invoke {}: {err}", self.binary),
            source: Some(Box::new(err)),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.run("image inspect", &["image", "inspect", "--format", "{{.Id}}", image]).await {
            Ok(_) => return Ok(()),
            Err(e @ RuntimeError::Unreachable { .. }) => return Err(e),
            Err(_) => {}
        }

        info!(image, "pulling image");
        match self.run("pull", &["pull", "--quiet", image]).await {
            Ok(_) => Ok(()),
            Err(e @ RuntimeError::Unreachable { .. }) => Err(e),
            Err(e) => Err(RuntimeError::ImageUnavailable {
                image: image.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a finished docker invocation to stdout or a [`RuntimeError`].
fn check_output(operation: &'static str, output: Output) -> Result<String, RuntimeError> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("Cannot connect to the Docker daemon") {
        return Err(RuntimeError::Unreachable {
            message: stderr,
            source: None,
        });
    }
    Err(RuntimeError::CommandFailed {
        operation,
        message: stderr,
    })
}

/// `docker kill` on an exited or removed container is not a failure.
fn is_already_stopped(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::CommandFailed { message, .. } => {
            message.contains("is not running") || message.contains("No such container")
        }
        _ => false,
    }
}

fn read_chunks<R>(reader: R) -> BoxStream<'static, Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((buf, reader))
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, task: &Task) -> Result<WorkloadHandle, RuntimeError> {
        self.ensure_image(task.image()).await?;

        let label = format!("{TASK_LABEL}={}", task.id());
        let mut args = vec!["create", "--label", label.as_str(), task.image()];
        args.extend(task.command().iter().map(String::as_str));
        let container_id = self.run("create", &args).await?;
        if container_id.is_empty() {
            return Err(RuntimeError::UnexpectedOutput {
                operation: "create",
                output: container_id,
            });
        }

        if let Err(e) = self.run("start", &["start", &container_id]).await {
            if let Err(rm) = self.run("rm", &["rm", "--force", &container_id]).await {
                warn!(container = %container_id, error = %rm, "failed to remove unstarted container");
            }
            return Err(e);
        }

        debug!(task_id = task.id(), container = %container_id, "container started");
        Ok(WorkloadHandle::new(container_id, task.id()))
    }

    async fn await_completion(&self, handle: &WorkloadHandle) -> Result<i64, RuntimeError> {
        let output = self.run("wait", &["wait", handle.id()]).await?;
        let exit_code = output
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok());
        exit_code.ok_or(RuntimeError::UnexpectedOutput {
            operation: "wait",
            output,
        })
    }

    async fn terminate(&self, handle: &WorkloadHandle) -> Result<(), RuntimeError> {
        match self.run("kill", &["kill", handle.id()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_stopped(&e) => {
                debug!(container = handle.id(), "container already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stream_output(&self, handle: &WorkloadHandle) -> Result<OutputStream, RuntimeError> {
        let mut child = self
            .command(&["logs", "--follow", handle.id()])
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RuntimeError::UnexpectedOutput {
                operation: "logs",
                output: "missing stdio pipes".to_string(),
            });
        };

        let merged = stream::select(read_chunks(stdout), read_chunks(stderr));
        // The child rides along in the stream state; dropping the stream
        // kills `docker logs`.
        let output = stream::unfold((merged, child), |(mut merged, child)| async move {
            merged.next().await.map(|chunk| (chunk, (merged, child)))
        })
        .boxed();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: exit_status(code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn successful_output_is_trimmed() {
        let out = check_output("create", output(0, "abc123\n", "")).unwrap();
        assert_eq!(out, "abc123");
    }

    #[cfg(unix)]
    #[test]
    fn daemon_down_is_unreachable() {
        let err = check_output(
            "start",
            output(
                1,
                "",
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock.",
            ),
        )
        .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[cfg(unix)]
    #[test]
    fn kill_of_stopped_container_is_tolerated() {
        let err = check_output(
            "kill",
            output(1, "", "Error response from daemon: container abc is not running"),
        )
        .unwrap_err();
        assert!(is_already_stopped(&err));

        let err = check_output("kill", output(1, "", "permission denied")).unwrap_err();
        assert!(!is_already_stopped(&err));
    }

    #[tokio::test]
    async fn missing_binary_is_unreachable() {
        let docker = DockerCli::new().with_binary("definitely-not-a-docker-binary-7f3a");
        let err = docker.start(&Task::demo("1")).await.unwrap_err();
        assert!(err.is_unreachable(), "expected Unreachable, got {err:?}");
    }
}
