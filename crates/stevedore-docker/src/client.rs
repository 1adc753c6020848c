//! The `docker` CLI client.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use stevedore_core::runtime::{
    ContainerRuntime, CreateContainerRequest, HealthCheckLogEntry, LineControl, RemovalOutcome,
    RuntimeContainer, RuntimeError, RuntimeImage, RuntimeNetwork,
};

const ERROR_TAIL_LINES: usize = 20;

/// Runtime adapter backed by the local `docker` binary.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a different binary, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a docker subcommand to completion, returning trimmed stdout.
    async fn capture(&self, args: &[String], context: &str) -> Result<String, RuntimeError> {
        tracing::debug!(context, ?args, "invoking docker");
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RuntimeError::command(
                context,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(
        &self,
        dir: &Path,
        build_args: &BTreeMap<String, String>,
        tag: &str,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<RuntimeImage, RuntimeError> {
        let mut args = vec!["build".to_string(), "--tag".to_string(), tag.to_string()];
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(dir.display().to_string());

        let mut child = self
            .command()
            .args(&args)
            // The classic builder emits the `Step N/M` progress lines the
            // engine parses.
            .env("DOCKER_BUILDKIT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Malformed("build process has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Malformed("build process has no stderr".to_string()))?;

        // Drain stderr concurrently so a chatty build cannot deadlock on
        // a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buffer).await;
            buffer
        });

        let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            on_line(&line);
            if tail.len() == ERROR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(RuntimeImage::new(tag))
        } else {
            let mut message = stderr_text.trim().to_string();
            if message.is_empty() {
                message = tail.iter().cloned().collect::<Vec<_>>().join("\n");
            }
            Err(RuntimeError::command("docker build", message))
        }
    }

    async fn pull_if_missing(&self, reference: &str) -> Result<RuntimeImage, RuntimeError> {
        let existing = self
            .capture(
                &[
                    "images".to_string(),
                    "-q".to_string(),
                    reference.to_string(),
                ],
                "docker images",
            )
            .await?;
        if !existing.is_empty() {
            tracing::debug!(reference, "image already present, skipping pull");
            return Ok(RuntimeImage::new(reference));
        }

        self.capture(
            &["pull".to_string(), reference.to_string()],
            "docker pull",
        )
        .await?;
        Ok(RuntimeImage::new(reference))
    }

    async fn create(
        &self,
        request: CreateContainerRequest,
    ) -> Result<RuntimeContainer, RuntimeError> {
        let args = create_args(&request);
        let id = self.capture(&args, "docker create").await?;
        if id.is_empty() {
            return Err(RuntimeError::Malformed(
                "docker create printed no container id".to_string(),
            ));
        }
        Ok(RuntimeContainer::new(id))
    }

    async fn run(
        &self,
        container: &RuntimeContainer,
        interactive: bool,
    ) -> Result<i64, RuntimeError> {
        let mut args = vec!["start".to_string(), "--attach".to_string()];
        if interactive {
            args.push("--interactive".to_string());
        }
        args.push(container.as_str().to_string());

        let status = self
            .command()
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(exit_code_of(status))
    }

    async fn start(&self, container: &RuntimeContainer) -> Result<(), RuntimeError> {
        self.capture(
            &["start".to_string(), container.as_str().to_string()],
            "docker start",
        )
        .await?;
        Ok(())
    }

    async fn stop(&self, container: &RuntimeContainer) -> Result<(), RuntimeError> {
        self.capture(
            &["stop".to_string(), container.as_str().to_string()],
            "docker stop",
        )
        .await?;
        Ok(())
    }

    async fn remove(
        &self,
        container: &RuntimeContainer,
        force: bool,
    ) -> Result<RemovalOutcome, RuntimeError> {
        let mut args = vec!["rm".to_string(), "--volumes".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(container.as_str().to_string());

        match self.capture(&args, "docker rm").await {
            Ok(_) => Ok(RemovalOutcome::Removed),
            Err(RuntimeError::Command { message, .. }) if is_missing_container(&message) => {
                Ok(RemovalOutcome::DidNotExist)
            }
            Err(e) => Err(e),
        }
    }

    async fn has_health_check(&self, container: &RuntimeContainer) -> Result<bool, RuntimeError> {
        let output = self
            .capture(
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{json .Config.Healthcheck}}".to_string(),
                    container.as_str().to_string(),
                ],
                "docker inspect",
            )
            .await?;
        Ok(output.trim() != "null")
    }

    async fn stream_events(
        &self,
        container: &RuntimeContainer,
        on_line: &mut (dyn for<'a> FnMut(&'a str) -> LineControl + Send),
    ) -> Result<(), RuntimeError> {
        let args = vec![
            "events".to_string(),
            "--filter".to_string(),
            format!("container={}", container.as_str()),
            "--filter".to_string(),
            "event=die".to_string(),
            "--filter".to_string(),
            "event=health_status".to_string(),
            "--format".to_string(),
            "{{.Status}}".to_string(),
        ];
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Malformed("event process has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            if on_line(&line) == LineControl::Stop {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Ok(());
            }
        }

        // The event stream ended on its own; report a failure exit.
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::command(
                "docker events",
                format!("event stream exited with status {}", status),
            ))
        }
    }

    async fn last_health_check(
        &self,
        container: &RuntimeContainer,
    ) -> Result<HealthCheckLogEntry, RuntimeError> {
        let output = self
            .capture(
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{json .State.Health.Log}}".to_string(),
                    container.as_str().to_string(),
                ],
                "docker inspect",
            )
            .await?;
        parse_health_log(&output)
    }

    async fn create_network(&self, name: &str) -> Result<RuntimeNetwork, RuntimeError> {
        let id = self
            .capture(
                &[
                    "network".to_string(),
                    "create".to_string(),
                    "--driver".to_string(),
                    "bridge".to_string(),
                    name.to_string(),
                ],
                "docker network create",
            )
            .await?;
        if id.is_empty() {
            return Err(RuntimeError::Malformed(
                "docker network create printed no id".to_string(),
            ));
        }
        Ok(RuntimeNetwork::new(id))
    }

    async fn delete_network(&self, network: &RuntimeNetwork) -> Result<(), RuntimeError> {
        self.capture(
            &[
                "network".to_string(),
                "rm".to_string(),
                network.as_str().to_string(),
            ],
            "docker network rm",
        )
        .await?;
        Ok(())
    }
}

/// Compose the full `docker create` argument list for a request.
fn create_args(request: &CreateContainerRequest) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        request.name.clone(),
        "--network".to_string(),
        request.network.as_str().to_string(),
        "--network-alias".to_string(),
        request.network_alias.clone(),
    ];

    if let Some(working_dir) = &request.working_dir {
        args.push("--workdir".to_string());
        args.push(working_dir.clone());
    }
    for (key, value) in &request.environment {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    for port in &request.ports {
        args.push("--publish".to_string());
        args.push(format!("{}:{}", port.local, port.container));
    }
    for volume in &request.volumes {
        args.push("--volume".to_string());
        let local = absolute_path(&volume.local);
        match &volume.options {
            Some(options) => args.push(format!("{}:{}:{}", local, volume.container, options)),
            None => args.push(format!("{}:{}", local, volume.container)),
        }
    }
    if let Some(interval) = request.health_interval {
        args.push("--health-interval".to_string());
        args.push(format!("{}ms", interval.as_millis()));
    }
    if let Some(retries) = request.health_retries {
        args.push("--health-retries".to_string());
        args.push(retries.to_string());
    }
    if let Some(start_period) = request.health_start_period {
        args.push("--health-start-period".to_string());
        args.push(format!("{}ms", start_period.as_millis()));
    }
    if let Some(user) = &request.user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    if request.attach_stdin {
        args.push("--interactive".to_string());
    }
    if request.allocate_tty {
        args.push("--tty".to_string());
    }

    args.push(request.image.as_str().to_string());
    if let Some(command) = &request.command {
        args.extend(command.iter().cloned());
    }
    args
}

fn absolute_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container")
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as i64;
        }
    }
    1
}

/// Parse the `.State.Health.Log` JSON array and return the most recent
/// probe result.
fn parse_health_log(raw: &str) -> Result<HealthCheckLogEntry, RuntimeError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| RuntimeError::Malformed(format!("health log is not valid JSON: {}", e)))?;
    let entries = value
        .as_array()
        .ok_or_else(|| RuntimeError::Malformed("health log is not an array".to_string()))?;
    let last = entries
        .last()
        .ok_or_else(|| RuntimeError::Malformed("health log is empty".to_string()))?;

    let exit_code = last
        .get("ExitCode")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RuntimeError::Malformed("health log entry has no exit code".to_string()))?;
    let output = last
        .get("Output")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(HealthCheckLogEntry { exit_code, output })
}
