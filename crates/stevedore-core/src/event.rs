//! The task event taxonomy.
//!
//! Events are facts: each one records something that happened during the
//! run. All orchestration policy lives in the reducer ([`crate::state`]),
//! which reads the event and the context and enqueues further steps.
//! Containers are referenced by config name; runtime identifiers travel
//! inside the event payloads.

use std::path::PathBuf;

use crate::runtime::{RuntimeContainer, RuntimeImage, RuntimeNetwork};

/// Something that happened during a task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    TaskStarted,
    ImageBuildProgress {
        container: String,
        step: u32,
        total: u32,
        label: String,
    },
    ImageBuilt {
        container: String,
        image: RuntimeImage,
    },
    ImagePulled {
        reference: String,
        image: RuntimeImage,
    },
    TaskNetworkCreated {
        network: RuntimeNetwork,
    },
    ContainerCreated {
        container: String,
        runtime_container: RuntimeContainer,
    },
    ContainerStarted {
        container: String,
    },
    ContainerBecameHealthy {
        container: String,
    },
    RunningContainerExited {
        container: String,
        exit_code: i64,
    },
    ContainerStopped {
        container: String,
    },
    ContainerRemoved {
        container: String,
    },
    TaskNetworkDeleted,
    TemporaryFileCreated {
        container: String,
        path: PathBuf,
    },
    TemporaryFileDeleted {
        path: PathBuf,
    },
    /// Terminal event posted by the `FinishTask` step; the dispatcher
    /// drains until it observes this.
    TaskFinished,

    // The failure family. Pre-run failures abort the task; post-run
    // failures are reported but cleanup continues.
    ImageBuildFailed {
        container: String,
        message: String,
    },
    ImagePullFailed {
        reference: String,
        message: String,
    },
    TaskNetworkCreationFailed {
        message: String,
    },
    ContainerCreationFailed {
        container: String,
        message: String,
    },
    ContainerStartFailed {
        container: String,
        message: String,
    },
    ContainerDidNotBecomeHealthy {
        container: String,
        message: String,
    },
    ContainerStopFailed {
        container: String,
        message: String,
    },
    ContainerRemovalFailed {
        container: String,
        message: String,
    },
    TaskNetworkDeletionFailed {
        message: String,
    },
    TemporaryFileDeletionFailed {
        path: PathBuf,
        message: String,
    },
}

impl TaskEvent {
    /// Whether this event is part of the failure family.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskEvent::ImageBuildFailed { .. }
                | TaskEvent::ImagePullFailed { .. }
                | TaskEvent::TaskNetworkCreationFailed { .. }
                | TaskEvent::ContainerCreationFailed { .. }
                | TaskEvent::ContainerStartFailed { .. }
                | TaskEvent::ContainerDidNotBecomeHealthy { .. }
                | TaskEvent::ContainerStopFailed { .. }
                | TaskEvent::ContainerRemovalFailed { .. }
                | TaskEvent::TaskNetworkDeletionFailed { .. }
                | TaskEvent::TemporaryFileDeletionFailed { .. }
        )
    }

    /// Whether observing this event aborts the run.
    ///
    /// Pre-run failures abort; post-run failures (stop, remove, network
    /// delete, temp-file delete) are reported without stopping cleanup on
    /// other resources.
    pub fn aborts_task(&self) -> bool {
        matches!(
            self,
            TaskEvent::ImageBuildFailed { .. }
                | TaskEvent::ImagePullFailed { .. }
                | TaskEvent::TaskNetworkCreationFailed { .. }
                | TaskEvent::ContainerCreationFailed { .. }
                | TaskEvent::ContainerStartFailed { .. }
                | TaskEvent::ContainerDidNotBecomeHealthy { .. }
        )
    }

    /// The failure message, for events that carry one.
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            TaskEvent::ImageBuildFailed { message, .. }
            | TaskEvent::ImagePullFailed { message, .. }
            | TaskEvent::TaskNetworkCreationFailed { message }
            | TaskEvent::ContainerCreationFailed { message, .. }
            | TaskEvent::ContainerStartFailed { message, .. }
            | TaskEvent::ContainerDidNotBecomeHealthy { message, .. }
            | TaskEvent::ContainerStopFailed { message, .. }
            | TaskEvent::ContainerRemovalFailed { message, .. }
            | TaskEvent::TaskNetworkDeletionFailed { message }
            | TaskEvent::TemporaryFileDeletionFailed { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Stable label for journal output and index keys.
    pub fn kind_label(&self) -> &'static str {
        match self {
            TaskEvent::TaskStarted => "task_started",
            TaskEvent::ImageBuildProgress { .. } => "image_build_progress",
            TaskEvent::ImageBuilt { .. } => "image_built",
            TaskEvent::ImagePulled { .. } => "image_pulled",
            TaskEvent::TaskNetworkCreated { .. } => "task_network_created",
            TaskEvent::ContainerCreated { .. } => "container_created",
            TaskEvent::ContainerStarted { .. } => "container_started",
            TaskEvent::ContainerBecameHealthy { .. } => "container_became_healthy",
            TaskEvent::RunningContainerExited { .. } => "running_container_exited",
            TaskEvent::ContainerStopped { .. } => "container_stopped",
            TaskEvent::ContainerRemoved { .. } => "container_removed",
            TaskEvent::TaskNetworkDeleted => "task_network_deleted",
            TaskEvent::TemporaryFileCreated { .. } => "temporary_file_created",
            TaskEvent::TemporaryFileDeleted { .. } => "temporary_file_deleted",
            TaskEvent::TaskFinished => "task_finished",
            TaskEvent::ImageBuildFailed { .. } => "image_build_failed",
            TaskEvent::ImagePullFailed { .. } => "image_pull_failed",
            TaskEvent::TaskNetworkCreationFailed { .. } => "task_network_creation_failed",
            TaskEvent::ContainerCreationFailed { .. } => "container_creation_failed",
            TaskEvent::ContainerStartFailed { .. } => "container_start_failed",
            TaskEvent::ContainerDidNotBecomeHealthy { .. } => "container_did_not_become_healthy",
            TaskEvent::ContainerStopFailed { .. } => "container_stop_failed",
            TaskEvent::ContainerRemovalFailed { .. } => "container_removal_failed",
            TaskEvent::TaskNetworkDeletionFailed { .. } => "task_network_deletion_failed",
            TaskEvent::TemporaryFileDeletionFailed { .. } => "temporary_file_deletion_failed",
        }
    }

    /// A one-paragraph description of the failure, naming the resource,
    /// for user-facing error output.
    pub fn failure_description(&self) -> Option<String> {
        match self {
            TaskEvent::ImageBuildFailed { container, message } => Some(format!(
                "Could not build the image for container '{}': {}",
                container, message
            )),
            TaskEvent::ImagePullFailed { reference, message } => Some(format!(
                "Could not pull the image '{}': {}",
                reference, message
            )),
            TaskEvent::TaskNetworkCreationFailed { message } => Some(format!(
                "Could not create the task network: {}",
                message
            )),
            TaskEvent::ContainerCreationFailed { container, message } => Some(format!(
                "Could not create the container '{}': {}",
                container, message
            )),
            TaskEvent::ContainerStartFailed { container, message } => Some(format!(
                "Could not start the container '{}': {}",
                container, message
            )),
            TaskEvent::ContainerDidNotBecomeHealthy { container, message } => Some(format!(
                "The container '{}' did not become healthy: {}",
                container, message
            )),
            TaskEvent::ContainerStopFailed { container, message } => Some(format!(
                "Could not stop the container '{}': {}",
                container, message
            )),
            TaskEvent::ContainerRemovalFailed { container, message } => Some(format!(
                "Could not remove the container '{}': {}",
                container, message
            )),
            TaskEvent::TaskNetworkDeletionFailed { message } => Some(format!(
                "Could not delete the task network: {}",
                message
            )),
            TaskEvent::TemporaryFileDeletionFailed { path, message } => Some(format!(
                "Could not delete the temporary file '{}': {}",
                path.display(),
                message
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_run_failures_abort() {
        let event = TaskEvent::ImageBuildFailed {
            container: "app".to_string(),
            message: "boom".to_string(),
        };
        assert!(event.is_failure());
        assert!(event.aborts_task());
    }

    #[test]
    fn test_post_run_failures_do_not_abort() {
        let stop = TaskEvent::ContainerStopFailed {
            container: "db".to_string(),
            message: "daemon hiccup".to_string(),
        };
        assert!(stop.is_failure());
        assert!(!stop.aborts_task());

        let net = TaskEvent::TaskNetworkDeletionFailed {
            message: "still attached".to_string(),
        };
        assert!(net.is_failure());
        assert!(!net.aborts_task());
    }

    #[test]
    fn test_non_failures_have_no_message() {
        assert_eq!(TaskEvent::TaskStarted.failure_message(), None);
        assert!(!TaskEvent::TaskFinished.is_failure());
    }
}
