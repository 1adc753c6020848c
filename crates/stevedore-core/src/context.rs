//! Per-run task context: the append-only event journal, the typed
//! indexes the reducer queries, and the ready-step queue.
//!
//! The context is owned by the dispatcher's single-writer drain loop;
//! workers never touch it, so the reducer always reads a consistent
//! snapshot of the log.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::event::TaskEvent;
use crate::graph::DependencyGraph;
use crate::runtime::{RuntimeContainer, RuntimeImage, RuntimeNetwork};
use crate::state;
use crate::step::{StepKey, TaskStep};

/// What to do with created resources when the run aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfterFailure {
    #[default]
    Cleanup,
    /// Leave resources behind for inspection; print manual removal
    /// commands instead.
    DontCleanup,
}

/// Per-run behaviour knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub after_failure: AfterFailure,
    pub propagate_proxy_env: bool,
    /// Command override from the task definition, already resolved to an
    /// argv; `None` keeps the task container's own command.
    pub task_command: Option<Vec<String>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            after_failure: AfterFailure::Cleanup,
            propagate_proxy_env: true,
            task_command: None,
        }
    }
}

/// A journaled event with the moment it was recorded.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    pub event: TaskEvent,
}

/// The state of one task run.
pub struct TaskContext {
    graph: Arc<DependencyGraph>,
    options: RunOptions,

    journal: Vec<RecordedEvent>,
    ready: VecDeque<TaskStep>,
    /// Keys of every step ever queued; suppresses duplicate work.
    seen_steps: HashSet<StepKey>,
    /// Every step that entered the queue (pending, in flight or done),
    /// in queue order. Cancelled creates are withdrawn.
    recorded_steps: Vec<TaskStep>,

    aborting: bool,

    // Typed indexes over the journal, maintained on append.
    images_built: HashMap<String, RuntimeImage>,
    images_pulled: HashMap<String, RuntimeImage>,
    network: Option<RuntimeNetwork>,
    network_deleted: bool,
    network_creation_failed: bool,
    created: HashMap<String, RuntimeContainer>,
    started: HashSet<String>,
    healthy: HashSet<String>,
    stopped: HashSet<String>,
    removed: HashSet<String>,
    removal_failed: HashSet<String>,
    creation_failed: HashSet<String>,
    temp_files: Vec<(String, PathBuf)>,
    task_exit_code: Option<i64>,
    finished: bool,
}

impl TaskContext {
    pub fn new(graph: Arc<DependencyGraph>, options: RunOptions) -> Self {
        Self {
            graph,
            options,
            journal: Vec::new(),
            ready: VecDeque::new(),
            seen_steps: HashSet::new(),
            recorded_steps: Vec::new(),
            aborting: false,
            images_built: HashMap::new(),
            images_pulled: HashMap::new(),
            network: None,
            network_deleted: false,
            network_creation_failed: false,
            created: HashMap::new(),
            started: HashSet::new(),
            healthy: HashSet::new(),
            stopped: HashSet::new(),
            removed: HashSet::new(),
            removal_failed: HashSet::new(),
            creation_failed: HashSet::new(),
            temp_files: Vec::new(),
            task_exit_code: None,
            finished: false,
        }
    }

    /// Append an event to the journal, update the indexes and run the
    /// reducer on it.
    pub fn post_event(&mut self, event: TaskEvent) {
        tracing::debug!(event = event.kind_label(), "event posted");
        self.index(&event);
        self.journal.push(RecordedEvent {
            at: Utc::now(),
            event: event.clone(),
        });
        state::apply(&event, self);
    }

    fn index(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::ImageBuilt { container, image } => {
                self.images_built.insert(container.clone(), image.clone());
            }
            TaskEvent::ImagePulled { reference, image } => {
                self.images_pulled.insert(reference.clone(), image.clone());
            }
            TaskEvent::TaskNetworkCreated { network } => {
                self.network = Some(network.clone());
            }
            TaskEvent::TaskNetworkDeleted => {
                self.network_deleted = true;
            }
            TaskEvent::TaskNetworkCreationFailed { .. } => {
                self.network_creation_failed = true;
            }
            TaskEvent::ContainerCreated {
                container,
                runtime_container,
            } => {
                self.created
                    .insert(container.clone(), runtime_container.clone());
            }
            TaskEvent::ContainerStarted { container } => {
                self.started.insert(container.clone());
            }
            TaskEvent::ContainerBecameHealthy { container } => {
                self.healthy.insert(container.clone());
            }
            TaskEvent::RunningContainerExited {
                container,
                exit_code,
            } => {
                if self.graph.is_task_container(container) {
                    self.task_exit_code = Some(*exit_code);
                }
            }
            TaskEvent::ContainerStopped { container } => {
                self.stopped.insert(container.clone());
            }
            TaskEvent::ContainerRemoved { container } => {
                self.removed.insert(container.clone());
            }
            TaskEvent::ContainerRemovalFailed { container, .. } => {
                self.removal_failed.insert(container.clone());
            }
            TaskEvent::ContainerCreationFailed { container, .. } => {
                self.creation_failed.insert(container.clone());
            }
            TaskEvent::TemporaryFileCreated { container, path } => {
                self.temp_files.push((container.clone(), path.clone()));
            }
            TaskEvent::TaskFinished => {
                self.finished = true;
            }
            _ => {}
        }
    }

    /// Add a step to the ready queue. Duplicate work (same kind and
    /// primary resource) is suppressed; while aborting, only cleanup
    /// steps are accepted.
    pub fn queue_step(&mut self, step: TaskStep) {
        if self.aborting && !step.is_cleanup() {
            tracing::debug!(step = step.kind_label(), "step dropped: run is aborting");
            return;
        }
        // A container is only ever removed by one step; a queued remove
        // makes the force-remove redundant and vice versa.
        if let TaskStep::CleanUpContainer { container, .. }
        | TaskStep::RemoveContainer { container, .. } = &step
        {
            if self.removal_requested(container) {
                return;
            }
        }
        if !self.seen_steps.insert(step.key()) {
            return;
        }
        tracing::debug!(step = step.kind_label(), "step queued");
        self.recorded_steps.push(step.clone());
        self.ready.push_back(step);
    }

    /// Next ready step, if any.
    pub fn take_ready_step(&mut self) -> Option<TaskStep> {
        self.ready.pop_front()
    }

    pub fn has_ready_steps(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Withdraw startup steps that have not been dispatched yet. Called
    /// when the run starts aborting.
    pub fn cancel_pending_startup_steps(&mut self) {
        // Only steps still sitting in the ready queue can be withdrawn; a
        // create already handed to a worker may yet produce a resource,
        // so its record stays and settlement waits for its outcome.
        let mut cancelled_creates: HashSet<String> = HashSet::new();
        let mut cancelled_network = false;
        self.ready.retain(|step| {
            match step {
                TaskStep::CreateContainer { container, .. } => {
                    cancelled_creates.insert(container.clone());
                }
                TaskStep::CreateTaskNetwork => cancelled_network = true,
                _ => {}
            }
            step.is_cleanup()
        });
        self.recorded_steps.retain(|step| match step {
            TaskStep::CreateContainer { container, .. } => !cancelled_creates.contains(container),
            TaskStep::CreateTaskNetwork => !cancelled_network,
            _ => true,
        });
    }

    // --- flags ---

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    /// Monotonic: the first aborting failure flips this, nothing clears it.
    pub fn mark_aborting(&mut self) {
        self.aborting = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn after_failure(&self) -> AfterFailure {
        self.options.after_failure
    }

    pub fn propagate_proxy_env(&self) -> bool {
        self.options.propagate_proxy_env
    }

    // --- graph queries ---

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn is_task_container(&self, name: &str) -> bool {
        self.graph.is_task_container(name)
    }

    /// The argv a container should run: the task override for the task
    /// container, the container's own command otherwise.
    pub fn command_for(&self, name: &str) -> Option<Vec<String>> {
        if self.graph.is_task_container(name) {
            if let Some(argv) = &self.options.task_command {
                return Some(argv.clone());
            }
        }
        self.graph
            .container(name)
            .and_then(|c| c.command.as_ref())
            .map(|c| c.to_argv())
    }

    // --- journal queries ---

    pub fn journal(&self) -> &[RecordedEvent] {
        &self.journal
    }

    pub fn network(&self) -> Option<&RuntimeNetwork> {
        self.network.as_ref()
    }

    pub fn network_deleted(&self) -> bool {
        self.network_deleted
    }

    /// The image for a container, if its build or pull has completed.
    pub fn image_ready_for(&self, name: &str) -> Option<&RuntimeImage> {
        if let Some(image) = self.images_built.get(name) {
            return Some(image);
        }
        let container = self.graph.container(name)?;
        match container.image_source() {
            stevedore_config::ImageSource::Pull(reference) => self.images_pulled.get(&reference),
            stevedore_config::ImageSource::Build { .. } => None,
        }
    }

    pub fn runtime_container(&self, name: &str) -> Option<&RuntimeContainer> {
        self.created.get(name)
    }

    /// Containers with a `ContainerCreated` in the log, and their
    /// runtime ids.
    pub fn created_containers(&self) -> impl Iterator<Item = (&str, &RuntimeContainer)> {
        self.created.iter().map(|(name, rc)| (name.as_str(), rc))
    }

    pub fn is_started(&self, name: &str) -> bool {
        self.started.contains(name)
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.healthy.contains(name)
    }

    pub fn is_removed(&self, name: &str) -> bool {
        self.removed.contains(name)
    }

    pub fn all_dependencies_healthy(&self, name: &str) -> bool {
        self.graph
            .dependencies_of(name)
            .all(|dep| self.healthy.contains(dep))
    }

    /// Dependency containers currently started and not yet stopped.
    pub fn started_dependencies(&self) -> Vec<String> {
        self.started
            .iter()
            .filter(|name| !self.stopped.contains(*name))
            .filter(|name| !self.graph.is_task_container(name))
            .cloned()
            .collect()
    }

    /// Whether a remove (forced or not) has already been queued for the
    /// container.
    pub fn removal_requested(&self, name: &str) -> bool {
        self.seen_steps
            .contains(&TaskStep::RemoveContainer {
                container: name.to_string(),
                runtime_container: RuntimeContainer::new(""),
            }
            .key())
            || self.seen_steps.contains(
                &TaskStep::CleanUpContainer {
                    container: name.to_string(),
                    runtime_container: RuntimeContainer::new(""),
                }
                .key(),
            )
    }

    /// Containers named by any pending or processed `CreateContainer`
    /// step, in queue order.
    pub fn containers_with_create_attempts(&self) -> Vec<String> {
        self.recorded_steps
            .iter()
            .filter_map(|step| match step {
                TaskStep::CreateContainer { container, .. } => Some(container.clone()),
                _ => None,
            })
            .collect()
    }

    /// True once every container a `CreateContainer` step was issued for
    /// has reached a terminal state: removed, removal failed, never
    /// created at all, or deliberately left behind by the
    /// don't-clean-up-after-failure policy.
    pub fn all_create_attempts_settled(&self) -> bool {
        let abandoned = self.aborting && self.options.after_failure == AfterFailure::DontCleanup;
        self.containers_with_create_attempts().iter().all(|name| {
            self.removed.contains(name)
                || self.removal_failed.contains(name)
                || self.creation_failed.contains(name)
                || (abandoned && self.created.contains_key(name))
        })
    }

    /// True while a `CreateTaskNetwork` step has been issued but neither
    /// outcome event has arrived; teardown must wait for it.
    pub fn network_attempt_outstanding(&self) -> bool {
        self.recorded_steps
            .iter()
            .any(|step| matches!(step, TaskStep::CreateTaskNetwork))
            && self.network.is_none()
            && !self.network_creation_failed
    }

    /// Temp files recorded for a container that have not been scheduled
    /// for deletion yet.
    pub fn temp_files_for(&self, name: &str) -> Vec<PathBuf> {
        self.temp_files
            .iter()
            .filter(|(owner, _)| owner == name)
            .map(|(_, path)| path.clone())
            .collect()
    }

    pub fn task_exit_code(&self) -> Option<i64> {
        self.task_exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_config::{Container, Project, Task};

    fn single_container_graph() -> Arc<DependencyGraph> {
        let mut containers = std::collections::BTreeMap::new();
        containers.insert(
            "app".to_string(),
            Container {
                image: Some("app:1".to_string()),
                ..Container::default()
            },
        );
        let project = Project {
            project: "demo".to_string(),
            containers,
            tasks: std::collections::BTreeMap::new(),
        };
        let task = Task {
            container: "app".to_string(),
            command: None,
            description: None,
        };
        Arc::new(DependencyGraph::resolve(&project, &task).expect("resolve"))
    }

    #[test]
    fn test_duplicate_steps_are_suppressed() {
        let mut ctx = TaskContext::new(single_container_graph(), RunOptions::default());
        ctx.queue_step(TaskStep::CreateTaskNetwork);
        ctx.queue_step(TaskStep::CreateTaskNetwork);

        assert!(ctx.take_ready_step().is_some());
        assert!(ctx.take_ready_step().is_none());
    }

    #[test]
    fn test_aborting_rejects_startup_steps() {
        let mut ctx = TaskContext::new(single_container_graph(), RunOptions::default());
        ctx.mark_aborting();
        ctx.queue_step(TaskStep::BuildImage {
            container: "app".to_string(),
        });
        assert!(!ctx.has_ready_steps());

        ctx.queue_step(TaskStep::FinishTask);
        assert!(ctx.has_ready_steps());
    }

    #[test]
    fn test_remove_then_clean_up_is_one_removal() {
        let mut ctx = TaskContext::new(single_container_graph(), RunOptions::default());
        let rc = RuntimeContainer::new("rc-1");
        ctx.queue_step(TaskStep::RemoveContainer {
            container: "app".to_string(),
            runtime_container: rc.clone(),
        });
        ctx.queue_step(TaskStep::CleanUpContainer {
            container: "app".to_string(),
            runtime_container: rc,
        });

        assert!(ctx.take_ready_step().is_some());
        assert!(ctx.take_ready_step().is_none());
    }

    #[test]
    fn test_cancel_pending_creates_withdraws_queued_work() {
        let mut ctx = TaskContext::new(single_container_graph(), RunOptions::default());
        ctx.queue_step(TaskStep::CreateContainer {
            container: "app".to_string(),
            image: RuntimeImage::new("app:1"),
            network: RuntimeNetwork::new("net"),
            command: None,
        });
        assert_eq!(ctx.containers_with_create_attempts(), vec!["app"]);

        ctx.cancel_pending_startup_steps();
        assert!(!ctx.has_ready_steps());
        assert!(ctx.containers_with_create_attempts().is_empty());
        assert!(ctx.all_create_attempts_settled());
    }

    #[test]
    fn test_network_attempt_must_settle_before_teardown() {
        let mut ctx = TaskContext::new(single_container_graph(), RunOptions::default());
        assert!(!ctx.network_attempt_outstanding());

        ctx.queue_step(TaskStep::CreateTaskNetwork);
        assert!(ctx.network_attempt_outstanding());

        ctx.post_event(TaskEvent::TaskNetworkCreated {
            network: RuntimeNetwork::new("net-1"),
        });
        assert!(!ctx.network_attempt_outstanding());
    }

    #[test]
    fn test_task_exit_code_is_recorded_from_journal() {
        let mut ctx = TaskContext::new(single_container_graph(), RunOptions::default());
        ctx.post_event(TaskEvent::RunningContainerExited {
            container: "app".to_string(),
            exit_code: 3,
        });
        assert_eq!(ctx.task_exit_code(), Some(3));
    }
}
