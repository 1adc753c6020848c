//! Quiet and simple loggers, plus logger selection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossterm::style::Color;

use stevedore_core::{EventLogger, TaskEvent, TaskStep};

use crate::console::Console;
use crate::fancy::FancyLogger;

/// How the run should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Fancy when the terminal supports it, simple otherwise.
    #[default]
    Auto,
    Simple,
    Quiet,
    Fancy,
}

/// Static facts about the run the loggers render.
#[derive(Debug, Clone)]
pub struct RunDisplay {
    pub task_name: String,
    pub task_container: String,
    /// Dependency container names, leaves first.
    pub dependencies: Vec<String>,
    /// Human-readable task command, when one is known.
    pub command: Option<String>,
    /// Pull references by container name, for mapping pull progress back
    /// to container lines.
    pub pull_references: BTreeMap<String, String>,
}

/// Pick the logger for a run.
///
/// Quiet and simple force their modes; otherwise the fancy logger is
/// used when the terminal supports cursor addressing, and the simple
/// logger when it does not.
pub fn select_logger(
    mode: OutputMode,
    console: Arc<Console>,
    display: RunDisplay,
) -> Arc<dyn EventLogger> {
    match mode {
        OutputMode::Quiet => Arc::new(QuietLogger::new(console)),
        OutputMode::Simple => Arc::new(SimpleLogger::new(console, display)),
        OutputMode::Fancy => Arc::new(FancyLogger::new(console, display)),
        OutputMode::Auto => {
            if console.supports_interactivity() {
                Arc::new(FancyLogger::new(console, display))
            } else {
                Arc::new(SimpleLogger::new(console, display))
            }
        }
    }
}

/// Render a failure surfaced by the engine as a red block.
pub(crate) fn print_failure(console: &Console, message: &str) {
    console.print_colored(Color::Red, message);
}

/// Whether the logger should render this event as a failure line.
///
/// Aborting failures arrive separately as `DisplayTaskFailure` steps, so
/// only post-run failures are rendered straight off the event stream.
pub(crate) fn renderable_failure(event: &TaskEvent) -> Option<String> {
    if event.is_failure() && !event.aborts_task() {
        event.failure_description()
    } else {
        None
    }
}

/// Failures only.
pub struct QuietLogger {
    console: Arc<Console>,
}

impl QuietLogger {
    pub fn new(console: Arc<Console>) -> Self {
        Self { console }
    }
}

#[async_trait]
impl EventLogger for QuietLogger {
    async fn step_starting(&self, step: &TaskStep) {
        if let TaskStep::DisplayTaskFailure { message } = step {
            print_failure(&self.console, message);
        }
    }

    async fn event_posted(&self, event: &TaskEvent) {
        if let Some(message) = renderable_failure(event) {
            print_failure(&self.console, &message);
        }
    }
}

/// One line per salient event; append-only, no cursor movement.
pub struct SimpleLogger {
    console: Arc<Console>,
    display: RunDisplay,
    cleanup_announced: Mutex<bool>,
}

impl SimpleLogger {
    pub fn new(console: Arc<Console>, display: RunDisplay) -> Self {
        Self {
            console,
            display,
            cleanup_announced: Mutex::new(false),
        }
    }

    fn announce_cleanup(&self) {
        let Ok(mut announced) = self.cleanup_announced.lock() else {
            return;
        };
        if !*announced {
            *announced = true;
            self.console.println("Cleaning up...");
        }
    }
}

#[async_trait]
impl EventLogger for SimpleLogger {
    async fn step_starting(&self, step: &TaskStep) {
        match step {
            TaskStep::BuildImage { container } => {
                self.console.println(&format!("Building {}...", container));
            }
            TaskStep::PullImage { reference } => {
                self.console.println(&format!("Pulling {}...", reference));
            }
            TaskStep::StartContainer { container, .. } => {
                self.console
                    .println(&format!("Starting dependency {}...", container));
            }
            TaskStep::WaitForHealth { container, .. } => {
                self.console
                    .println(&format!("Waiting for {} to become healthy...", container));
            }
            TaskStep::RunContainer { container, .. } => match &self.display.command {
                Some(command) => self
                    .console
                    .println(&format!("Running {} in {}...", command, container)),
                None => self.console.println(&format!("Running {}...", container)),
            },
            TaskStep::StopContainer { .. }
            | TaskStep::RemoveContainer { .. }
            | TaskStep::CleanUpContainer { .. }
            | TaskStep::DeleteTaskNetwork { .. } => self.announce_cleanup(),
            TaskStep::DisplayTaskFailure { message } => print_failure(&self.console, message),
            TaskStep::BeginTask
            | TaskStep::CreateTaskNetwork
            | TaskStep::CreateContainer { .. }
            | TaskStep::DeleteTemporaryFile { .. }
            | TaskStep::FinishTask => {}
        }
    }

    async fn event_posted(&self, event: &TaskEvent) {
        if let Some(message) = renderable_failure(event) {
            print_failure(&self.console, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renderable_failure_skips_aborting_failures() {
        let aborting = TaskEvent::ImageBuildFailed {
            container: "app".to_string(),
            message: "boom".to_string(),
        };
        assert!(renderable_failure(&aborting).is_none());

        let post_run = TaskEvent::ContainerRemovalFailed {
            container: "db".to_string(),
            message: "in use".to_string(),
        };
        let message = renderable_failure(&post_run).expect("rendered");
        assert!(message.contains("db"));
        assert!(message.contains("in use"));
    }

    #[test]
    fn test_non_failures_are_not_rendered() {
        assert!(renderable_failure(&TaskEvent::TaskStarted).is_none());
        assert!(renderable_failure(&TaskEvent::TaskNetworkDeleted).is_none());
    }
}
