//! The dispatcher: a bounded worker pool over the ready-step queue.
//!
//! Workers execute steps against the runtime adapter and post resulting
//! events onto a single serialized channel. The drain loop owns the
//! context: it applies every event inline (single writer), so the
//! reducer always reads a consistent journal while runtime calls proceed
//! in parallel. The loop ends when the terminal event is observed, at
//! which point outstanding workers are cancelled and their results
//! discarded.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::TaskContext;
use crate::event::TaskEvent;
use crate::runner::StepRunner;
use crate::step::TaskStep;

/// Exit code reported when the task container never ran.
pub const ORCHESTRATION_FAILURE_EXIT_CODE: i32 = 70;

/// Observer of the run: notified of every step the dispatcher starts and
/// every event posted to the journal.
#[async_trait]
pub trait EventLogger: Send + Sync {
    async fn step_starting(&self, step: &TaskStep);
    async fn event_posted(&self, event: &TaskEvent);
}

/// Logger that renders nothing. Useful for tests and embedding.
pub struct NullEventLogger;

#[async_trait]
impl EventLogger for NullEventLogger {
    async fn step_starting(&self, _step: &TaskStep) {}
    async fn event_posted(&self, _event: &TaskEvent) {}
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The task container ran; its exit code is the run's exit code,
    /// taking precedence over any post-run cleanup failures.
    TaskExited { exit_code: i64 },
    /// The task container never ran.
    Failed,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::TaskExited { exit_code } => *exit_code as i32,
            RunOutcome::Failed => ORCHESTRATION_FAILURE_EXIT_CODE,
        }
    }
}

/// Pulls ready steps, runs them on up to `max_parallel` workers, and
/// feeds their events back into the context.
pub struct Dispatcher {
    runner: Arc<StepRunner>,
    logger: Arc<dyn EventLogger>,
    max_parallel: usize,
}

impl Dispatcher {
    pub fn new(runner: Arc<StepRunner>, logger: Arc<dyn EventLogger>) -> Self {
        let max_parallel = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            runner,
            logger,
            max_parallel,
        }
    }

    /// Bound the number of concurrently executing steps.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Drive the run to completion.
    pub async fn run(&self, ctx: &mut TaskContext) -> RunOutcome {
        let cancel = CancellationToken::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<TaskEvent>();
        let mut in_flight = FuturesUnordered::new();

        ctx.queue_step(TaskStep::BeginTask);

        loop {
            // Apply everything workers have posted so far.
            while let Ok(event) = events_rx.try_recv() {
                self.apply(ctx, event).await;
            }
            if ctx.is_finished() {
                break;
            }

            // Top up the worker pool from the ready queue.
            while in_flight.len() < self.max_parallel {
                let Some(step) = ctx.take_ready_step() else {
                    break;
                };
                self.logger.step_starting(&step).await;
                tracing::debug!(step = step.kind_label(), "dispatching step");
                let runner = Arc::clone(&self.runner);
                let events = events_tx.clone();
                let token = cancel.child_token();
                in_flight.push(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = runner.execute(step, &events) => {}
                    }
                });
            }

            if in_flight.is_empty() {
                // No workers and nothing ready: either a late event is
                // sitting in the channel, or the engine has stalled.
                match events_rx.try_recv() {
                    Ok(event) => {
                        self.apply(ctx, event).await;
                        continue;
                    }
                    Err(_) => {
                        tracing::error!(
                            "engine stalled: no steps ready, none in flight, run not finished"
                        );
                        return RunOutcome::Failed;
                    }
                }
            }

            tokio::select! {
                Some(event) = events_rx.recv() => {
                    self.apply(ctx, event).await;
                }
                Some(()) = in_flight.next() => {}
            }
        }

        // Cancel outstanding workers and wait for them to acknowledge;
        // dropping their runtime-call futures kills any subprocesses.
        cancel.cancel();
        while in_flight.next().await.is_some() {}

        match ctx.task_exit_code() {
            Some(exit_code) => RunOutcome::TaskExited { exit_code },
            None => RunOutcome::Failed,
        }
    }

    async fn apply(&self, ctx: &mut TaskContext, event: TaskEvent) {
        self.logger.event_posted(&event).await;
        ctx.post_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::context::{AfterFailure, RunOptions};
    use crate::graph::DependencyGraph;
    use crate::runtime::{
        ContainerRuntime, CreateContainerRequest, HealthCheckLogEntry, LineControl,
        RemovalOutcome, RuntimeContainer, RuntimeError, RuntimeImage, RuntimeNetwork,
    };

    use stevedore_config::{Container, Project, Task};

    /// Scripted behaviour for one container, keyed by config name.
    #[derive(Clone, Default)]
    struct ContainerScript {
        has_health_check: bool,
        event_lines: Vec<&'static str>,
        last_health: Option<(i64, &'static str)>,
        run_exit_code: i64,
        create_delay: Option<Duration>,
        create_failure: Option<&'static str>,
        remove_reports_missing: bool,
    }

    /// In-memory runtime with per-container scripts and a call log.
    #[derive(Default)]
    struct FakeRuntime {
        scripts: HashMap<String, ContainerScript>,
        pull_delays: HashMap<String, Duration>,
        build_failure: Option<&'static str>,
        build_delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn with_script(mut self, name: &str, script: ContainerScript) -> Self {
            self.scripts.insert(name.to_string(), script);
            self
        }

        fn with_pull_delay(mut self, reference: &str, delay: Duration) -> Self {
            self.pull_delays.insert(reference.to_string(), delay);
            self
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().expect("lock").push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }

        fn script_for_id(&self, id: &RuntimeContainer) -> ContainerScript {
            let name = id.as_str().strip_prefix("rc-").unwrap_or(id.as_str());
            self.scripts.get(name).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn build_image(
            &self,
            dir: &std::path::Path,
            _build_args: &BTreeMap<String, String>,
            tag: &str,
            on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<RuntimeImage, RuntimeError> {
            self.record(format!("build {}", dir.display()));
            if let Some(delay) = self.build_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = self.build_failure {
                return Err(RuntimeError::command("docker build", message));
            }
            on_line("Step 1/2 : FROM alpine");
            on_line("Step 2/2 : RUN true");
            Ok(RuntimeImage::new(tag))
        }

        async fn pull_if_missing(&self, reference: &str) -> Result<RuntimeImage, RuntimeError> {
            self.record(format!("pull {}", reference));
            if let Some(delay) = self.pull_delays.get(reference) {
                tokio::time::sleep(*delay).await;
            }
            Ok(RuntimeImage::new(reference))
        }

        async fn create(
            &self,
            request: CreateContainerRequest,
        ) -> Result<RuntimeContainer, RuntimeError> {
            self.record(format!("create {}", request.network_alias));
            let script = self
                .scripts
                .get(&request.network_alias)
                .cloned()
                .unwrap_or_default();
            if let Some(delay) = script.create_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = script.create_failure {
                return Err(RuntimeError::command("docker create", message));
            }
            Ok(RuntimeContainer::new(format!("rc-{}", request.network_alias)))
        }

        async fn run(
            &self,
            container: &RuntimeContainer,
            _interactive: bool,
        ) -> Result<i64, RuntimeError> {
            self.record(format!("run {}", container));
            Ok(self.script_for_id(container).run_exit_code)
        }

        async fn start(&self, container: &RuntimeContainer) -> Result<(), RuntimeError> {
            self.record(format!("start {}", container));
            Ok(())
        }

        async fn stop(&self, container: &RuntimeContainer) -> Result<(), RuntimeError> {
            self.record(format!("stop {}", container));
            Ok(())
        }

        async fn remove(
            &self,
            container: &RuntimeContainer,
            force: bool,
        ) -> Result<RemovalOutcome, RuntimeError> {
            self.record(format!("remove {} force={}", container, force));
            if self.script_for_id(container).remove_reports_missing {
                Ok(RemovalOutcome::DidNotExist)
            } else {
                Ok(RemovalOutcome::Removed)
            }
        }

        async fn has_health_check(
            &self,
            container: &RuntimeContainer,
        ) -> Result<bool, RuntimeError> {
            Ok(self.script_for_id(container).has_health_check)
        }

        async fn stream_events(
            &self,
            container: &RuntimeContainer,
            on_line: &mut (dyn for<'a> FnMut(&'a str) -> LineControl + Send),
        ) -> Result<(), RuntimeError> {
            for line in self.script_for_id(container).event_lines {
                if on_line(line) == LineControl::Stop {
                    break;
                }
            }
            Ok(())
        }

        async fn last_health_check(
            &self,
            container: &RuntimeContainer,
        ) -> Result<HealthCheckLogEntry, RuntimeError> {
            let (exit_code, output) = self
                .script_for_id(container)
                .last_health
                .ok_or_else(|| RuntimeError::Malformed("no health log recorded".to_string()))?;
            Ok(HealthCheckLogEntry {
                exit_code,
                output: output.to_string(),
            })
        }

        async fn create_network(&self, name: &str) -> Result<RuntimeNetwork, RuntimeError> {
            self.record("create_network".to_string());
            Ok(RuntimeNetwork::new(name))
        }

        async fn delete_network(&self, _network: &RuntimeNetwork) -> Result<(), RuntimeError> {
            self.record("delete_network".to_string());
            Ok(())
        }

        async fn delete_temporary_file(
            &self,
            path: &std::path::PathBuf,
        ) -> Result<(), RuntimeError> {
            self.record(format!("delete_temp_file {}", path.display()));
            Ok(())
        }
    }

    /// Logger that records steps and events for assertions.
    #[derive(Default)]
    struct RecordingLogger {
        steps: Mutex<Vec<TaskStep>>,
        events: Mutex<Vec<TaskEvent>>,
    }

    impl RecordingLogger {
        fn events(&self) -> Vec<TaskEvent> {
            self.events.lock().expect("lock").clone()
        }

        fn steps(&self) -> Vec<TaskStep> {
            self.steps.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl EventLogger for RecordingLogger {
        async fn step_starting(&self, step: &TaskStep) {
            self.steps.lock().expect("lock").push(step.clone());
        }

        async fn event_posted(&self, event: &TaskEvent) {
            self.events.lock().expect("lock").push(event.clone());
        }
    }

    struct Harness {
        runtime: Arc<FakeRuntime>,
        logger: Arc<RecordingLogger>,
        dispatcher: Dispatcher,
        ctx: TaskContext,
    }

    fn harness(
        containers: Vec<(&str, Vec<&str>)>,
        task_container: &str,
        runtime: FakeRuntime,
        options: RunOptions,
        max_parallel: usize,
    ) -> Harness {
        let mut map = BTreeMap::new();
        for (name, deps) in containers {
            map.insert(
                name.to_string(),
                Container {
                    image: Some(format!("{}:1", name)),
                    dependencies: deps.into_iter().map(str::to_string).collect(),
                    ..Container::default()
                },
            );
        }
        let project = Project {
            project: "demo".to_string(),
            containers: map,
            tasks: BTreeMap::new(),
        };
        let task = Task {
            container: task_container.to_string(),
            command: None,
            description: None,
        };
        let graph = Arc::new(DependencyGraph::resolve(&project, &task).expect("resolve"));

        let runtime = Arc::new(runtime);
        let logger = Arc::new(RecordingLogger::default());
        let runner = Arc::new(StepRunner::new(
            runtime.clone(),
            graph.clone(),
            "demo",
            false,
            false,
        ));
        let dispatcher =
            Dispatcher::new(runner, logger.clone()).with_max_parallel(max_parallel);
        let ctx = TaskContext::new(graph, options);

        Harness {
            runtime,
            logger,
            dispatcher,
            ctx,
        }
    }

    fn labels(events: &[TaskEvent]) -> Vec<&'static str> {
        events.iter().map(TaskEvent::kind_label).collect()
    }

    fn position(events: &[TaskEvent], wanted: &TaskEvent) -> usize {
        events
            .iter()
            .position(|e| e == wanted)
            .unwrap_or_else(|| panic!("event {:?} not observed in {:?}", wanted, events))
    }

    #[tokio::test]
    async fn test_single_task_container_runs_to_completion() {
        let runtime = FakeRuntime::default().with_script("app", ContainerScript::default());
        let mut h = harness(
            vec![("app", vec![])],
            "app",
            runtime,
            RunOptions::default(),
            1,
        );

        let outcome = h.dispatcher.run(&mut h.ctx).await;
        assert_eq!(outcome, RunOutcome::TaskExited { exit_code: 0 });
        assert_eq!(outcome.exit_code(), 0);

        assert_eq!(
            labels(&h.logger.events()),
            vec![
                "task_started",
                "image_pulled",
                "task_network_created",
                "container_created",
                "running_container_exited",
                "container_stopped",
                "container_removed",
                "task_network_deleted",
                "task_finished",
            ]
        );
    }

    #[tokio::test]
    async fn test_task_with_healthy_dependency() {
        let runtime = FakeRuntime::default()
            .with_script(
                "db",
                ContainerScript {
                    has_health_check: true,
                    event_lines: vec!["health_status: healthy"],
                    ..ContainerScript::default()
                },
            )
            .with_script("app", ContainerScript::default());
        let mut h = harness(
            vec![("app", vec!["db"]), ("db", vec![])],
            "app",
            runtime,
            RunOptions::default(),
            1,
        );

        let outcome = h.dispatcher.run(&mut h.ctx).await;
        assert_eq!(outcome, RunOutcome::TaskExited { exit_code: 0 });

        let events = h.logger.events();
        let created_db = position(
            &events,
            &TaskEvent::ContainerCreated {
                container: "db".to_string(),
                runtime_container: RuntimeContainer::new("rc-db"),
            },
        );
        let started_db = position(
            &events,
            &TaskEvent::ContainerStarted {
                container: "db".to_string(),
            },
        );
        let healthy_db = position(
            &events,
            &TaskEvent::ContainerBecameHealthy {
                container: "db".to_string(),
            },
        );
        let exited = position(
            &events,
            &TaskEvent::RunningContainerExited {
                container: "app".to_string(),
                exit_code: 0,
            },
        );
        let stopped_db = position(
            &events,
            &TaskEvent::ContainerStopped {
                container: "db".to_string(),
            },
        );
        let removed_db = position(
            &events,
            &TaskEvent::ContainerRemoved {
                container: "db".to_string(),
            },
        );
        let removed_app = position(
            &events,
            &TaskEvent::ContainerRemoved {
                container: "app".to_string(),
            },
        );
        let network_deleted = position(&events, &TaskEvent::TaskNetworkDeleted);

        assert!(created_db < started_db);
        assert!(started_db < healthy_db);
        assert!(healthy_db < exited);
        assert!(exited < stopped_db);
        assert!(stopped_db < removed_db);
        assert!(removed_db < network_deleted);
        assert!(removed_app < network_deleted);
        assert_eq!(labels(&events).last(), Some(&"task_finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_dependency_aborts_before_task_creation() {
        // app's pull is slow, so the abort lands before app's create is
        // ever enqueued.
        let runtime = FakeRuntime::default()
            .with_script(
                "db",
                ContainerScript {
                    has_health_check: true,
                    event_lines: vec!["health_status: unhealthy"],
                    last_health: Some((1, "connection refused")),
                    ..ContainerScript::default()
                },
            )
            .with_pull_delay("app:1", Duration::from_secs(5));
        let mut h = harness(
            vec![("app", vec!["db"]), ("db", vec![])],
            "app",
            runtime,
            RunOptions::default(),
            4,
        );

        let outcome = h.dispatcher.run(&mut h.ctx).await;
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(outcome.exit_code(), ORCHESTRATION_FAILURE_EXIT_CODE);

        let events = h.logger.events();
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::ContainerDidNotBecomeHealthy { container, message }
                if container == "db" && message.contains("connection refused")
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            TaskEvent::ContainerCreated { container, .. } if container == "app"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::ContainerRemoved { container } if container == "db"
        )));
        assert!(events.contains(&TaskEvent::TaskNetworkDeleted));
        assert_eq!(labels(&events).last(), Some(&"task_finished"));

        // The unhealthy container was force-removed.
        assert!(h
            .runtime
            .calls()
            .contains(&"remove rc-db force=true".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_with_cleanup_disabled() {
        // The network is created while the slow build is still running,
        // then the build fails.
        let mut containers = BTreeMap::new();
        containers.insert(
            "app".to_string(),
            Container {
                build: Some(std::path::PathBuf::from("./docker/app")),
                ..Container::default()
            },
        );
        let project = Project {
            project: "demo".to_string(),
            containers,
            tasks: BTreeMap::new(),
        };
        let task = Task {
            container: "app".to_string(),
            command: None,
            description: None,
        };
        let graph = Arc::new(DependencyGraph::resolve(&project, &task).expect("resolve"));

        let runtime = Arc::new(FakeRuntime {
            build_failure: Some("RUN cargo build exited with status 101"),
            build_delay: Some(Duration::from_secs(2)),
            ..FakeRuntime::default()
        });
        let logger = Arc::new(RecordingLogger::default());
        let runner = Arc::new(StepRunner::new(
            runtime.clone(),
            graph.clone(),
            "demo",
            false,
            false,
        ));
        let dispatcher = Dispatcher::new(runner, logger.clone()).with_max_parallel(4);
        let mut ctx = TaskContext::new(
            graph,
            RunOptions {
                after_failure: AfterFailure::DontCleanup,
                ..RunOptions::default()
            },
        );

        let outcome = dispatcher.run(&mut ctx).await;
        assert_eq!(outcome, RunOutcome::Failed);

        let events = logger.events();
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::ImageBuildFailed { container, message }
                if container == "app" && message.contains("status 101")
        )));
        // No containers existed, so the network still comes down.
        assert!(events.contains(&TaskEvent::TaskNetworkDeleted));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TaskEvent::ContainerCreated { .. })));
        assert_eq!(labels(&events).last(), Some(&"task_finished"));

        // The failure was surfaced through a display step.
        assert!(logger.steps().iter().any(|s| matches!(
            s,
            TaskStep::DisplayTaskFailure { message } if message.contains("Could not build the image")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_created_during_abort_is_cleaned_up() {
        // app's create is in flight when db's health check fails; the
        // late container goes straight into teardown.
        let runtime = FakeRuntime::default()
            .with_script(
                "db",
                ContainerScript {
                    has_health_check: true,
                    event_lines: vec!["health_status: unhealthy"],
                    last_health: Some((1, "not ready")),
                    ..ContainerScript::default()
                },
            )
            .with_script(
                "app",
                ContainerScript {
                    create_delay: Some(Duration::from_secs(5)),
                    ..ContainerScript::default()
                },
            );
        let mut h = harness(
            vec![("app", vec!["db"]), ("db", vec![])],
            "app",
            runtime,
            RunOptions::default(),
            4,
        );

        let outcome = h.dispatcher.run(&mut h.ctx).await;
        assert_eq!(outcome, RunOutcome::Failed);

        let events = h.logger.events();
        let created_app = position(
            &events,
            &TaskEvent::ContainerCreated {
                container: "app".to_string(),
                runtime_container: RuntimeContainer::new("rc-app"),
            },
        );
        let removed_app = position(
            &events,
            &TaskEvent::ContainerRemoved {
                container: "app".to_string(),
            },
        );
        assert!(created_app < removed_app);
        assert!(h.logger.steps().iter().any(|s| matches!(
            s,
            TaskStep::CleanUpContainer { container, .. } if container == "app"
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TaskEvent::RunningContainerExited { .. })));
        assert_eq!(labels(&events).last(), Some(&"task_finished"));
    }

    #[tokio::test]
    async fn test_task_exit_code_takes_precedence() {
        let runtime = FakeRuntime::default().with_script(
            "app",
            ContainerScript {
                run_exit_code: 3,
                ..ContainerScript::default()
            },
        );
        let mut h = harness(
            vec![("app", vec![])],
            "app",
            runtime,
            RunOptions::default(),
            2,
        );

        let outcome = h.dispatcher.run(&mut h.ctx).await;
        assert_eq!(outcome, RunOutcome::TaskExited { exit_code: 3 });
        assert_eq!(outcome.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_removing_a_missing_container_counts_as_removed() {
        let runtime = FakeRuntime::default().with_script(
            "app",
            ContainerScript {
                remove_reports_missing: true,
                ..ContainerScript::default()
            },
        );
        let mut h = harness(
            vec![("app", vec![])],
            "app",
            runtime,
            RunOptions::default(),
            1,
        );

        let outcome = h.dispatcher.run(&mut h.ctx).await;
        assert_eq!(outcome, RunOutcome::TaskExited { exit_code: 0 });
        assert!(h.logger.events().iter().any(|e| matches!(
            e,
            TaskEvent::ContainerRemoved { container } if container == "app"
        )));
    }

    #[tokio::test]
    async fn test_every_created_container_is_removed_under_parallelism() {
        let runtime = FakeRuntime::default()
            .with_script(
                "db",
                ContainerScript {
                    has_health_check: true,
                    event_lines: vec!["health_status: healthy"],
                    ..ContainerScript::default()
                },
            )
            .with_script("cache", ContainerScript::default())
            .with_script("app", ContainerScript::default());
        let mut h = harness(
            vec![("app", vec!["db", "cache"]), ("db", vec![]), ("cache", vec![])],
            "app",
            runtime,
            RunOptions::default(),
            4,
        );

        let outcome = h.dispatcher.run(&mut h.ctx).await;
        assert_eq!(outcome, RunOutcome::TaskExited { exit_code: 0 });

        let events = h.logger.events();
        for name in ["app", "db", "cache"] {
            let created = events.iter().any(|e| matches!(
                e,
                TaskEvent::ContainerCreated { container, .. } if container == name
            ));
            let removed = events.iter().any(|e| matches!(
                e,
                TaskEvent::ContainerRemoved { container } if container == name
            ));
            assert!(created, "{} was never created", name);
            assert!(removed, "{} was never removed", name);
        }
        let network_deleted = position(&events, &TaskEvent::TaskNetworkDeleted);
        for name in ["app", "db", "cache"] {
            let removed = position(
                &events,
                &TaskEvent::ContainerRemoved {
                    container: name.to_string(),
                },
            );
            assert!(removed < network_deleted);
        }
    }
}
