//! Step execution.
//!
//! The step runner is stateless with respect to the run: it receives one
//! step, drives the runtime adapter, and posts the resulting events onto
//! the serialized event channel. Failures become events; nothing is
//! thrown past this layer.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use stevedore_config::{ImageSource, VolumeMount};

use crate::event::TaskEvent;
use crate::graph::DependencyGraph;
use crate::runtime::{
    ContainerRuntime, CreateContainerRequest, LineControl, RemovalOutcome, RuntimeContainer,
    RuntimeImage, RuntimeNetwork,
};
use crate::step::TaskStep;

const BUILD_TAG_PREFIX: &str = "stevedore";

const PROXY_ENVIRONMENT_VARIABLES: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "ftp_proxy",
    "no_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "FTP_PROXY",
    "NO_PROXY",
];

/// Executes steps against the container runtime.
pub struct StepRunner {
    runtime: Arc<dyn ContainerRuntime>,
    graph: Arc<DependencyGraph>,
    project_name: String,
    /// Short per-run id used to namespace runtime resource names.
    run_id: String,
    propagate_proxy_env: bool,
    stdin_is_tty: bool,
}

impl StepRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        graph: Arc<DependencyGraph>,
        project_name: impl Into<String>,
        propagate_proxy_env: bool,
        stdin_is_tty: bool,
    ) -> Self {
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            runtime,
            graph,
            project_name: project_name.into(),
            run_id,
            propagate_proxy_env,
            stdin_is_tty,
        }
    }

    /// Execute one step, posting resulting events as they are produced.
    pub async fn execute(&self, step: TaskStep, events: &UnboundedSender<TaskEvent>) {
        match step {
            TaskStep::BeginTask => post(events, TaskEvent::TaskStarted),
            TaskStep::BuildImage { container } => self.build_image(&container, events).await,
            TaskStep::PullImage { reference } => self.pull_image(&reference, events).await,
            TaskStep::CreateTaskNetwork => self.create_task_network(events).await,
            TaskStep::CreateContainer {
                container,
                image,
                network,
                command,
            } => {
                self.create_container(&container, image, network, command, events)
                    .await
            }
            TaskStep::RunContainer {
                container,
                runtime_container,
            } => self.run_container(&container, &runtime_container, events).await,
            TaskStep::StartContainer {
                container,
                runtime_container,
            } => self.start_container(&container, &runtime_container, events).await,
            TaskStep::WaitForHealth {
                container,
                runtime_container,
            } => self.wait_for_health(&container, &runtime_container, events).await,
            TaskStep::StopContainer {
                container,
                runtime_container,
            } => self.stop_container(&container, &runtime_container, events).await,
            TaskStep::RemoveContainer {
                container,
                runtime_container,
            } => {
                self.remove_container(&container, &runtime_container, false, events)
                    .await
            }
            TaskStep::CleanUpContainer {
                container,
                runtime_container,
            } => {
                self.remove_container(&container, &runtime_container, true, events)
                    .await
            }
            TaskStep::DeleteTaskNetwork { network } => {
                self.delete_task_network(&network, events).await
            }
            TaskStep::DeleteTemporaryFile { path } => {
                self.delete_temporary_file(path, events).await
            }
            // Rendered by the event logger when the step starts; there is
            // nothing to execute.
            TaskStep::DisplayTaskFailure { .. } => {}
            TaskStep::FinishTask => post(events, TaskEvent::TaskFinished),
        }
    }

    /// The stable synthetic tag for a container's built image,
    /// deterministic per (project, container).
    pub fn build_tag(&self, container: &str) -> String {
        let name = format!("{}/{}", self.project_name, container);
        format!(
            "{}-{}",
            BUILD_TAG_PREFIX,
            Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
        )
    }

    fn runtime_container_name(&self, container: &str) -> String {
        format!("{}-{}-{}", self.project_name, container, self.run_id)
    }

    fn network_name(&self) -> String {
        format!("{}-task-{}", self.project_name, self.run_id)
    }

    async fn build_image(&self, container: &str, events: &UnboundedSender<TaskEvent>) {
        let Some(definition) = self.graph.container(container) else {
            post_internal_error(events, container);
            return;
        };
        let ImageSource::Build { dir, args } = definition.image_source() else {
            post_internal_error(events, container);
            return;
        };

        let tag = self.build_tag(container);
        let mut built_id: Option<String> = None;
        let mut on_line = |line: &str| {
            if let Some((step, total, label)) = parse_build_progress(line) {
                post(
                    events,
                    TaskEvent::ImageBuildProgress {
                        container: container.to_string(),
                        step,
                        total,
                        label,
                    },
                );
            } else if let Some(id) = parse_built_image_id(line) {
                built_id = Some(id);
            }
        };

        match self.runtime.build_image(&dir, &args, &tag, &mut on_line).await {
            Ok(image) => {
                let image = built_id.map(RuntimeImage::new).unwrap_or(image);
                post(
                    events,
                    TaskEvent::ImageBuilt {
                        container: container.to_string(),
                        image,
                    },
                );
            }
            Err(e) => post(
                events,
                TaskEvent::ImageBuildFailed {
                    container: container.to_string(),
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn pull_image(&self, reference: &str, events: &UnboundedSender<TaskEvent>) {
        match self.runtime.pull_if_missing(reference).await {
            Ok(image) => post(
                events,
                TaskEvent::ImagePulled {
                    reference: reference.to_string(),
                    image,
                },
            ),
            Err(e) => post(
                events,
                TaskEvent::ImagePullFailed {
                    reference: reference.to_string(),
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn create_task_network(&self, events: &UnboundedSender<TaskEvent>) {
        match self.runtime.create_network(&self.network_name()).await {
            Ok(network) => post(events, TaskEvent::TaskNetworkCreated { network }),
            Err(e) => post(
                events,
                TaskEvent::TaskNetworkCreationFailed {
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn create_container(
        &self,
        container: &str,
        image: RuntimeImage,
        network: RuntimeNetwork,
        command: Option<Vec<String>>,
        events: &UnboundedSender<TaskEvent>,
    ) {
        let Some(definition) = self.graph.container(container) else {
            post_internal_error(events, container);
            return;
        };

        let mut environment = BTreeMap::new();
        if self.propagate_proxy_env {
            for variable in PROXY_ENVIRONMENT_VARIABLES {
                if let Ok(value) = std::env::var(variable) {
                    environment.insert(variable.to_string(), value);
                }
            }
        }
        environment.extend(definition.environment.clone());

        let mut volumes = definition.volumes.clone();
        let mut user = None;
        if definition.run_as_current_user {
            match generate_current_user_files() {
                Ok(files) => {
                    // Recorded before the create attempt so cleanup is
                    // guaranteed even when creation fails.
                    post(
                        events,
                        TaskEvent::TemporaryFileCreated {
                            container: container.to_string(),
                            path: files.passwd.clone(),
                        },
                    );
                    post(
                        events,
                        TaskEvent::TemporaryFileCreated {
                            container: container.to_string(),
                            path: files.group.clone(),
                        },
                    );
                    volumes.push(VolumeMount {
                        local: files.passwd,
                        container: "/etc/passwd".to_string(),
                        options: Some("ro".to_string()),
                    });
                    volumes.push(VolumeMount {
                        local: files.group,
                        container: "/etc/group".to_string(),
                        options: Some("ro".to_string()),
                    });
                    user = Some(format!("{}:{}", files.uid, files.gid));
                }
                Err(message) => {
                    post(
                        events,
                        TaskEvent::ContainerCreationFailed {
                            container: container.to_string(),
                            message,
                        },
                    );
                    return;
                }
            }
        }

        let is_task_container = self.graph.is_task_container(container);
        let request = CreateContainerRequest {
            name: self.runtime_container_name(container),
            network_alias: container.to_string(),
            image,
            network,
            command,
            working_dir: definition.working_dir.clone(),
            environment,
            ports: definition.ports.clone(),
            volumes,
            health_interval: definition.health.interval,
            health_retries: definition.health.retries,
            health_start_period: definition.health.start_period,
            user,
            attach_stdin: is_task_container,
            allocate_tty: is_task_container && self.stdin_is_tty,
        };

        match self.runtime.create(request).await {
            Ok(runtime_container) => post(
                events,
                TaskEvent::ContainerCreated {
                    container: container.to_string(),
                    runtime_container,
                },
            ),
            Err(e) => post(
                events,
                TaskEvent::ContainerCreationFailed {
                    container: container.to_string(),
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn run_container(
        &self,
        container: &str,
        runtime_container: &RuntimeContainer,
        events: &UnboundedSender<TaskEvent>,
    ) {
        match self.runtime.run(runtime_container, self.stdin_is_tty).await {
            Ok(exit_code) => post(
                events,
                TaskEvent::RunningContainerExited {
                    container: container.to_string(),
                    exit_code,
                },
            ),
            Err(e) => post(
                events,
                TaskEvent::ContainerStartFailed {
                    container: container.to_string(),
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn start_container(
        &self,
        container: &str,
        runtime_container: &RuntimeContainer,
        events: &UnboundedSender<TaskEvent>,
    ) {
        match self.runtime.start(runtime_container).await {
            Ok(()) => post(
                events,
                TaskEvent::ContainerStarted {
                    container: container.to_string(),
                },
            ),
            Err(e) => post(
                events,
                TaskEvent::ContainerStartFailed {
                    container: container.to_string(),
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn wait_for_health(
        &self,
        container: &str,
        runtime_container: &RuntimeContainer,
        events: &UnboundedSender<TaskEvent>,
    ) {
        match self.runtime.has_health_check(runtime_container).await {
            Ok(false) => {
                // No check configured means healthy by declaration.
                post(
                    events,
                    TaskEvent::ContainerBecameHealthy {
                        container: container.to_string(),
                    },
                );
                return;
            }
            Ok(true) => {}
            Err(e) => {
                post(
                    events,
                    TaskEvent::ContainerDidNotBecomeHealthy {
                        container: container.to_string(),
                        message: format!("could not inspect the container's health check: {}", e),
                    },
                );
                return;
            }
        }

        let deadline = self
            .graph
            .container(container)
            .map(|c| c.health.wait_deadline())
            .unwrap_or(stevedore_config::HealthCheckConfig::default().wait_deadline());

        let mut observed: Option<HealthTransition> = None;
        let stream_result = {
            let mut on_line = |line: &str| match parse_health_line(line) {
                Some(transition) => {
                    observed = Some(transition);
                    LineControl::Stop
                }
                None => LineControl::Continue,
            };
            tokio::time::timeout(
                deadline,
                self.runtime.stream_events(runtime_container, &mut on_line),
            )
            .await
        };

        let message = match stream_result {
            Err(_) => Some(format!(
                "The container did not report a health status within {}s.",
                deadline.as_secs()
            )),
            Ok(Err(e)) => Some(format!("The container's event stream failed: {}", e)),
            Ok(Ok(())) => match observed {
                Some(HealthTransition::Healthy) => {
                    post(
                        events,
                        TaskEvent::ContainerBecameHealthy {
                            container: container.to_string(),
                        },
                    );
                    None
                }
                Some(HealthTransition::Unhealthy) => {
                    Some(self.describe_failed_health_check(runtime_container).await)
                }
                Some(HealthTransition::Died) => {
                    Some("The container exited before becoming healthy.".to_string())
                }
                None => Some(
                    "The container's event stream ended before it reported a health status."
                        .to_string(),
                ),
            },
        };

        if let Some(message) = message {
            post(
                events,
                TaskEvent::ContainerDidNotBecomeHealthy {
                    container: container.to_string(),
                    message,
                },
            );
        }
    }

    async fn describe_failed_health_check(&self, runtime_container: &RuntimeContainer) -> String {
        match self.runtime.last_health_check(runtime_container).await {
            Ok(entry) => format!(
                "The configured health check reported unhealthy. The last health check exited with code {} and output: {}",
                entry.exit_code,
                entry.output.trim()
            ),
            Err(e) => format!(
                "The configured health check reported unhealthy, and the last health check result could not be retrieved: {}",
                e
            ),
        }
    }

    async fn stop_container(
        &self,
        container: &str,
        runtime_container: &RuntimeContainer,
        events: &UnboundedSender<TaskEvent>,
    ) {
        match self.runtime.stop(runtime_container).await {
            Ok(()) => post(
                events,
                TaskEvent::ContainerStopped {
                    container: container.to_string(),
                },
            ),
            Err(e) => post(
                events,
                TaskEvent::ContainerStopFailed {
                    container: container.to_string(),
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn remove_container(
        &self,
        container: &str,
        runtime_container: &RuntimeContainer,
        force: bool,
        events: &UnboundedSender<TaskEvent>,
    ) {
        match self.runtime.remove(runtime_container, force).await {
            // A container that is already gone counts as removed; the
            // run may have crashed in the middle of a prior removal.
            Ok(RemovalOutcome::Removed) | Ok(RemovalOutcome::DidNotExist) => post(
                events,
                TaskEvent::ContainerRemoved {
                    container: container.to_string(),
                },
            ),
            Err(e) => post(
                events,
                TaskEvent::ContainerRemovalFailed {
                    container: container.to_string(),
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn delete_task_network(
        &self,
        network: &RuntimeNetwork,
        events: &UnboundedSender<TaskEvent>,
    ) {
        match self.runtime.delete_network(network).await {
            Ok(()) => post(events, TaskEvent::TaskNetworkDeleted),
            Err(e) => post(
                events,
                TaskEvent::TaskNetworkDeletionFailed {
                    message: e.to_string(),
                },
            ),
        }
    }

    async fn delete_temporary_file(&self, path: PathBuf, events: &UnboundedSender<TaskEvent>) {
        match self.runtime.delete_temporary_file(&path).await {
            Ok(()) => post(events, TaskEvent::TemporaryFileDeleted { path }),
            Err(e) => post(
                events,
                TaskEvent::TemporaryFileDeletionFailed {
                    path,
                    message: e.to_string(),
                },
            ),
        }
    }
}

fn post(events: &UnboundedSender<TaskEvent>, event: TaskEvent) {
    // The receiver only disappears once the dispatcher has observed the
    // terminal event; late results are discarded by design.
    let _ = events.send(event);
}

fn post_internal_error(events: &UnboundedSender<TaskEvent>, container: &str) {
    tracing::error!(container, "step referenced a container missing from the graph");
    post(
        events,
        TaskEvent::ContainerCreationFailed {
            container: container.to_string(),
            message: "internal error: container is not part of this task's dependency graph"
                .to_string(),
        },
    );
}

/// Observed transition from a container's runtime event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthTransition {
    Healthy,
    Unhealthy,
    Died,
}

/// Parse one line of the runtime event stream. Anything that is not a
/// `health_status` transition or a `die` event is ignored.
fn parse_health_line(line: &str) -> Option<HealthTransition> {
    match line.trim() {
        "health_status: healthy" => Some(HealthTransition::Healthy),
        "health_status: unhealthy" => Some(HealthTransition::Unhealthy),
        "die" => Some(HealthTransition::Died),
        _ => None,
    }
}

/// Parse a `Step <N>/<M> : <instruction>` build progress line.
fn parse_build_progress(line: &str) -> Option<(u32, u32, String)> {
    let rest = line.strip_prefix("Step ")?;
    let (step, rest) = rest.split_once('/')?;
    let (total, label) = rest.split_once(" : ")?;
    let step = step.trim().parse().ok()?;
    let total = total.trim().parse().ok()?;
    Some((step, total, label.trim().to_string()))
}

/// Parse the image id from a `Successfully built <id>` line.
fn parse_built_image_id(line: &str) -> Option<String> {
    let id = line.strip_prefix("Successfully built ")?.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
struct CurrentUserFiles {
    passwd: PathBuf,
    group: PathBuf,
    uid: u32,
    gid: u32,
}

/// Generate passwd and group files describing the invoking user, so a
/// container can run as them without the image knowing the uid.
#[cfg(unix)]
fn generate_current_user_files() -> Result<CurrentUserFiles, String> {
    let uid = current_id("-u")?;
    let gid = current_id("-g")?;

    let passwd_content = format!(
        "root:x:0:0:root:/root:/bin/sh\nstevedore:x:{}:{}:stevedore:/home/stevedore:/bin/sh\n",
        uid, gid
    );
    let group_content = format!("root:x:0:\nstevedore:x:{}:\n", gid);

    let passwd = persist_temp_file("stevedore-passwd-", &passwd_content)?;
    let group = persist_temp_file("stevedore-group-", &group_content)?;

    Ok(CurrentUserFiles {
        passwd,
        group,
        uid,
        gid,
    })
}

#[cfg(not(unix))]
fn generate_current_user_files() -> Result<CurrentUserFiles, String> {
    Err("run_as_current_user is not supported on this platform".to_string())
}

#[cfg(unix)]
fn current_id(flag: &str) -> Result<u32, String> {
    let output = std::process::Command::new("id")
        .arg(flag)
        .output()
        .map_err(|e| format!("could not determine the current user: {}", e))?;
    if !output.status.success() {
        return Err(format!(
            "'id {}' exited with status {}",
            flag, output.status
        ));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|_| "could not parse the current user id".to_string())
}

#[cfg(unix)]
fn persist_temp_file(prefix: &str, content: &str) -> Result<PathBuf, String> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()
        .map_err(|e| format!("could not create a temporary file: {}", e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| format!("could not write the temporary file: {}", e))?;
    let (_, path) = file
        .keep()
        .map_err(|e| format!("could not persist the temporary file: {}", e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::runtime::{HealthCheckLogEntry, RuntimeError};

    #[test]
    fn test_parse_build_progress_lines() {
        assert_eq!(
            parse_build_progress("Step 2/5 : RUN cargo build"),
            Some((2, 5, "RUN cargo build".to_string()))
        );
        assert_eq!(parse_build_progress("Sending build context"), None);
        assert_eq!(parse_build_progress("Step x/5 : RUN true"), None);
    }

    #[test]
    fn test_parse_built_image_id() {
        assert_eq!(
            parse_built_image_id("Successfully built 0123abcd"),
            Some("0123abcd".to_string())
        );
        assert_eq!(parse_built_image_id("Successfully tagged app:1"), None);
    }

    #[test]
    fn test_parse_health_lines() {
        assert_eq!(
            parse_health_line("health_status: healthy"),
            Some(HealthTransition::Healthy)
        );
        assert_eq!(
            parse_health_line("health_status: unhealthy"),
            Some(HealthTransition::Unhealthy)
        );
        assert_eq!(parse_health_line("die"), Some(HealthTransition::Died));
        assert_eq!(parse_health_line("start"), None);
        assert_eq!(parse_health_line(""), None);
    }

    /// Minimal health-wait fake: scripted inspect answer and event lines.
    struct HealthScriptRuntime {
        has_check: bool,
        lines: Vec<String>,
        last_check: Option<HealthCheckLogEntry>,
        streamed: Mutex<bool>,
    }

    impl HealthScriptRuntime {
        fn new(has_check: bool, lines: Vec<&str>) -> Self {
            Self {
                has_check,
                lines: lines.into_iter().map(str::to_string).collect(),
                last_check: None,
                streamed: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for HealthScriptRuntime {
        async fn build_image(
            &self,
            _dir: &std::path::Path,
            _build_args: &BTreeMap<String, String>,
            _tag: &str,
            _on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<RuntimeImage, RuntimeError> {
            unimplemented!("not exercised")
        }

        async fn pull_if_missing(&self, reference: &str) -> Result<RuntimeImage, RuntimeError> {
            Ok(RuntimeImage::new(reference))
        }

        async fn create(
            &self,
            _request: CreateContainerRequest,
        ) -> Result<RuntimeContainer, RuntimeError> {
            unimplemented!("not exercised")
        }

        async fn run(
            &self,
            _container: &RuntimeContainer,
            _interactive: bool,
        ) -> Result<i64, RuntimeError> {
            unimplemented!("not exercised")
        }

        async fn start(&self, _container: &RuntimeContainer) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn stop(&self, _container: &RuntimeContainer) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove(
            &self,
            _container: &RuntimeContainer,
            _force: bool,
        ) -> Result<RemovalOutcome, RuntimeError> {
            Ok(RemovalOutcome::Removed)
        }

        async fn has_health_check(
            &self,
            _container: &RuntimeContainer,
        ) -> Result<bool, RuntimeError> {
            Ok(self.has_check)
        }

        async fn stream_events(
            &self,
            _container: &RuntimeContainer,
            on_line: &mut (dyn for<'a> FnMut(&'a str) -> LineControl + Send),
        ) -> Result<(), RuntimeError> {
            *self.streamed.lock().expect("lock") = true;
            for line in &self.lines {
                if on_line(line) == LineControl::Stop {
                    break;
                }
            }
            Ok(())
        }

        async fn last_health_check(
            &self,
            _container: &RuntimeContainer,
        ) -> Result<HealthCheckLogEntry, RuntimeError> {
            self.last_check
                .clone()
                .ok_or_else(|| RuntimeError::Malformed("no health log".to_string()))
        }

        async fn create_network(&self, name: &str) -> Result<RuntimeNetwork, RuntimeError> {
            Ok(RuntimeNetwork::new(name))
        }

        async fn delete_network(&self, _network: &RuntimeNetwork) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn runner_with(runtime: Arc<dyn ContainerRuntime>) -> StepRunner {
        let mut containers = BTreeMap::new();
        containers.insert(
            "db".to_string(),
            stevedore_config::Container {
                image: Some("db:1".to_string()),
                ..stevedore_config::Container::default()
            },
        );
        let project = stevedore_config::Project {
            project: "demo".to_string(),
            containers,
            tasks: BTreeMap::new(),
        };
        let task = stevedore_config::Task {
            container: "db".to_string(),
            command: None,
            description: None,
        };
        let graph = Arc::new(DependencyGraph::resolve(&project, &task).expect("resolve"));
        StepRunner::new(runtime, graph, "demo", false, false)
    }

    async fn wait_events(runner: &StepRunner) -> Vec<TaskEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        runner
            .execute(
                TaskStep::WaitForHealth {
                    container: "db".to_string(),
                    runtime_container: RuntimeContainer::new("rc-db"),
                },
                &tx,
            )
            .await;
        drop(tx);
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_missing_health_check_is_immediately_healthy() {
        let runtime = Arc::new(HealthScriptRuntime::new(false, vec![]));
        let events = wait_events(&runner_with(runtime.clone())).await;
        assert_eq!(
            events,
            vec![TaskEvent::ContainerBecameHealthy {
                container: "db".to_string()
            }]
        );
        assert!(!*runtime.streamed.lock().expect("lock"));
    }

    #[tokio::test]
    async fn test_healthy_transition_reports_healthy() {
        let runtime = Arc::new(HealthScriptRuntime::new(
            true,
            vec!["start", "health_status: healthy"],
        ));
        let events = wait_events(&runner_with(runtime)).await;
        assert_eq!(
            events,
            vec![TaskEvent::ContainerBecameHealthy {
                container: "db".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_unhealthy_transition_reports_last_probe() {
        let mut runtime = HealthScriptRuntime::new(true, vec!["health_status: unhealthy"]);
        runtime.last_check = Some(HealthCheckLogEntry {
            exit_code: 1,
            output: "connection refused\n".to_string(),
        });
        let events = wait_events(&runner_with(Arc::new(runtime))).await;
        match events.as_slice() {
            [TaskEvent::ContainerDidNotBecomeHealthy { container, message }] => {
                assert_eq!(container, "db");
                assert!(message.contains("exited with code 1"));
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_death_before_health_status() {
        let runtime = Arc::new(HealthScriptRuntime::new(true, vec!["die"]));
        let events = wait_events(&runner_with(runtime)).await;
        match events.as_slice() {
            [TaskEvent::ContainerDidNotBecomeHealthy { message, .. }] => {
                assert!(message.contains("exited before becoming healthy"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_ending_without_status_is_a_failure() {
        let runtime = Arc::new(HealthScriptRuntime::new(true, vec!["start"]));
        let events = wait_events(&runner_with(runtime)).await;
        match events.as_slice() {
            [TaskEvent::ContainerDidNotBecomeHealthy { message, .. }] => {
                assert!(message.contains("ended before it reported"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_build_tag_is_stable_per_project_and_container() {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(HealthScriptRuntime::new(false, vec![]));
        let a = runner_with(runtime.clone());
        let b = runner_with(runtime);
        assert_eq!(a.build_tag("db"), b.build_tag("db"));
        assert_ne!(a.build_tag("db"), a.build_tag("app"));
    }
}
