//! The task step taxonomy.
//!
//! A step is a unit of work the dispatcher hands to a worker. Each
//! variant carries enough state to execute independently of the context;
//! the step runner only needs the step and the runtime adapter.

use std::path::PathBuf;

use crate::runtime::{RuntimeContainer, RuntimeImage, RuntimeNetwork};

/// A unit of work in a task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStep {
    BeginTask,
    BuildImage {
        container: String,
    },
    PullImage {
        reference: String,
    },
    CreateTaskNetwork,
    CreateContainer {
        container: String,
        image: RuntimeImage,
        network: RuntimeNetwork,
        command: Option<Vec<String>>,
    },
    /// Start the task container attached to stdio and wait for it to exit.
    RunContainer {
        container: String,
        runtime_container: RuntimeContainer,
    },
    /// Start a dependency container detached.
    StartContainer {
        container: String,
        runtime_container: RuntimeContainer,
    },
    WaitForHealth {
        container: String,
        runtime_container: RuntimeContainer,
    },
    StopContainer {
        container: String,
        runtime_container: RuntimeContainer,
    },
    RemoveContainer {
        container: String,
        runtime_container: RuntimeContainer,
    },
    /// Force-remove variant used while aborting; converges even when the
    /// container never started or is still running.
    CleanUpContainer {
        container: String,
        runtime_container: RuntimeContainer,
    },
    DeleteTaskNetwork {
        network: RuntimeNetwork,
    },
    DeleteTemporaryFile {
        path: PathBuf,
    },
    /// Surface a message to the user without touching the runtime.
    DisplayTaskFailure {
        message: String,
    },
    FinishTask,
}

/// Duplicate-suppression key: step kind plus the primary resource it
/// touches. Two steps with equal keys are the same work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    kind: &'static str,
    primary: String,
}

impl TaskStep {
    pub fn key(&self) -> StepKey {
        let (kind, primary) = match self {
            TaskStep::BeginTask => ("begin_task", String::new()),
            TaskStep::BuildImage { container } => ("build_image", container.clone()),
            TaskStep::PullImage { reference } => ("pull_image", reference.clone()),
            TaskStep::CreateTaskNetwork => ("create_task_network", String::new()),
            TaskStep::CreateContainer { container, .. } => ("create_container", container.clone()),
            TaskStep::RunContainer { container, .. } => ("run_container", container.clone()),
            TaskStep::StartContainer { container, .. } => ("start_container", container.clone()),
            TaskStep::WaitForHealth { container, .. } => ("wait_for_health", container.clone()),
            TaskStep::StopContainer { container, .. } => ("stop_container", container.clone()),
            TaskStep::RemoveContainer { container, .. } => ("remove_container", container.clone()),
            TaskStep::CleanUpContainer { container, .. } => {
                ("clean_up_container", container.clone())
            }
            TaskStep::DeleteTaskNetwork { .. } => ("delete_task_network", String::new()),
            TaskStep::DeleteTemporaryFile { path } => {
                ("delete_temporary_file", path.display().to_string())
            }
            TaskStep::DisplayTaskFailure { message } => ("display_task_failure", message.clone()),
            TaskStep::FinishTask => ("finish_task", String::new()),
        };
        StepKey { kind, primary }
    }

    /// Whether this step is part of cleanup rather than startup. While a
    /// run is aborting, only cleanup work may enter the queue.
    pub fn is_cleanup(&self) -> bool {
        matches!(
            self,
            TaskStep::StopContainer { .. }
                | TaskStep::RemoveContainer { .. }
                | TaskStep::CleanUpContainer { .. }
                | TaskStep::DeleteTaskNetwork { .. }
                | TaskStep::DeleteTemporaryFile { .. }
                | TaskStep::DisplayTaskFailure { .. }
                | TaskStep::FinishTask
        )
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            TaskStep::BeginTask => "begin_task",
            TaskStep::BuildImage { .. } => "build_image",
            TaskStep::PullImage { .. } => "pull_image",
            TaskStep::CreateTaskNetwork => "create_task_network",
            TaskStep::CreateContainer { .. } => "create_container",
            TaskStep::RunContainer { .. } => "run_container",
            TaskStep::StartContainer { .. } => "start_container",
            TaskStep::WaitForHealth { .. } => "wait_for_health",
            TaskStep::StopContainer { .. } => "stop_container",
            TaskStep::RemoveContainer { .. } => "remove_container",
            TaskStep::CleanUpContainer { .. } => "clean_up_container",
            TaskStep::DeleteTaskNetwork { .. } => "delete_task_network",
            TaskStep::DeleteTemporaryFile { .. } => "delete_temporary_file",
            TaskStep::DisplayTaskFailure { .. } => "display_task_failure",
            TaskStep::FinishTask => "finish_task",
        }
    }
}
