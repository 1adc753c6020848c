//! The fancy logger: a cursor-addressed live progress region.
//!
//! Startup view: one line per container showing its current phase.
//! Once the task container exits (or the first cleanup step starts) the
//! region switches to a cleanup view enumerating containers being
//! removed. Every update erases the previous region and rewrites it.
//! When the terminal width cannot be determined the logger downgrades to
//! simple append-only lines for the rest of the run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stevedore_core::{EventLogger, TaskEvent, TaskStep};

use crate::console::Console;
use crate::logger::{print_failure, renderable_failure, RunDisplay};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Waiting,
    Pulling,
    Building { step: u32, total: u32 },
    ImageReady,
    Creating,
    Created,
    Starting,
    WaitingForHealthCheck,
    Healthy,
    Running,
    Exited(i64),
    Failed,
    Removing,
    Removed,
}

impl Phase {
    fn label(&self) -> String {
        match self {
            Phase::Waiting => "waiting".to_string(),
            Phase::Pulling => "pulling".to_string(),
            Phase::Building { step: 0, total: 0 } => "building".to_string(),
            Phase::Building { step, total } => format!("building ({}/{})", step, total),
            Phase::ImageReady => "image ready".to_string(),
            Phase::Creating => "creating".to_string(),
            Phase::Created => "created".to_string(),
            Phase::Starting => "starting".to_string(),
            Phase::WaitingForHealthCheck => "waiting for healthcheck".to_string(),
            Phase::Healthy => "healthy".to_string(),
            Phase::Running => "running".to_string(),
            Phase::Exited(code) => format!("exited ({})", code),
            Phase::Failed => "failed".to_string(),
            Phase::Removing => "removing".to_string(),
            Phase::Removed => "removed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Startup,
    Cleanup,
}

struct FancyState {
    phases: BTreeMap<String, Phase>,
    view: View,
    drawn_lines: u16,
    downgraded: bool,
}

/// Live multi-line progress display.
pub struct FancyLogger {
    console: Arc<Console>,
    display: RunDisplay,
    state: Mutex<FancyState>,
}

impl FancyLogger {
    pub fn new(console: Arc<Console>, display: RunDisplay) -> Self {
        let mut phases = BTreeMap::new();
        for dependency in &display.dependencies {
            phases.insert(dependency.clone(), Phase::Waiting);
        }
        phases.insert(display.task_container.clone(), Phase::Waiting);

        Self {
            console,
            display,
            state: Mutex::new(FancyState {
                phases,
                view: View::Startup,
                drawn_lines: 0,
                downgraded: false,
            }),
        }
    }

    /// Containers using the given pull reference.
    fn containers_for_reference(&self, reference: &str) -> Vec<String> {
        self.display
            .pull_references
            .iter()
            .filter(|(_, r)| r.as_str() == reference)
            .map(|(container, _)| container.clone())
            .collect()
    }

    fn update(&self, apply: impl FnOnce(&mut FancyState)) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        apply(&mut state);
        self.redraw(&mut state);
    }

    /// Print above the live region: erase it, write the message, then
    /// repaint the region below.
    fn print_above(&self, message: &str) {
        let Ok(mut state) = self.state.lock() else {
            print_failure(&self.console, message);
            return;
        };
        if !state.downgraded {
            self.console.clear_last_lines(state.drawn_lines);
            state.drawn_lines = 0;
        }
        print_failure(&self.console, message);
        self.redraw(&mut state);
    }

    fn redraw(&self, state: &mut FancyState) {
        if state.downgraded {
            return;
        }
        let Some(width) = self.console.width() else {
            // Terminal width unknown: permanently fall back to simple
            // output for the rest of the run.
            state.downgraded = true;
            state.drawn_lines = 0;
            return;
        };

        self.console.clear_last_lines(state.drawn_lines);

        let lines = self.render_lines(state);
        for line in &lines {
            self.console.println(&truncate_to(line, width as usize));
        }
        state.drawn_lines = lines.len() as u16;
    }

    fn render_lines(&self, state: &FancyState) -> Vec<String> {
        let mut lines = Vec::with_capacity(state.phases.len() + 1);
        match state.view {
            View::Startup => {
                lines.push(format!("Running task {}:", self.display.task_name));
                for name in self
                    .display
                    .dependencies
                    .iter()
                    .chain(std::iter::once(&self.display.task_container))
                {
                    let phase = state.phases.get(name).cloned().unwrap_or(Phase::Waiting);
                    lines.push(format!("  {}: {}", name, phase.label()));
                }
            }
            View::Cleanup => {
                lines.push("Cleaning up:".to_string());
                for (name, phase) in &state.phases {
                    match phase {
                        Phase::Removing => lines.push(format!("  removing {}", name)),
                        Phase::Removed => lines.push(format!("  removed {}", name)),
                        _ => {}
                    }
                }
            }
        }
        lines
    }

    fn set_phase(&self, container: &str, phase: Phase) {
        self.update(|state| {
            state.phases.insert(container.to_string(), phase);
        });
    }
}

#[async_trait]
impl EventLogger for FancyLogger {
    async fn step_starting(&self, step: &TaskStep) {
        match step {
            TaskStep::BuildImage { container } => {
                self.set_phase(container, Phase::Building { step: 0, total: 0 });
            }
            TaskStep::PullImage { reference } => {
                let containers = self.containers_for_reference(reference);
                self.update(|state| {
                    for container in containers {
                        state.phases.insert(container, Phase::Pulling);
                    }
                });
            }
            TaskStep::CreateContainer { container, .. } => {
                self.set_phase(container, Phase::Creating);
            }
            TaskStep::StartContainer { container, .. } => {
                self.set_phase(container, Phase::Starting);
            }
            TaskStep::WaitForHealth { container, .. } => {
                self.set_phase(container, Phase::WaitingForHealthCheck);
            }
            TaskStep::RunContainer { container, .. } => {
                self.set_phase(container, Phase::Running);
            }
            TaskStep::StopContainer { container, .. }
            | TaskStep::RemoveContainer { container, .. }
            | TaskStep::CleanUpContainer { container, .. } => {
                self.update(|state| {
                    state.view = View::Cleanup;
                    state.phases.insert(container.clone(), Phase::Removing);
                });
            }
            TaskStep::DeleteTaskNetwork { .. } => {
                self.update(|state| {
                    state.view = View::Cleanup;
                });
            }
            TaskStep::DisplayTaskFailure { message } => {
                self.print_above(message);
            }
            TaskStep::BeginTask
            | TaskStep::CreateTaskNetwork
            | TaskStep::DeleteTemporaryFile { .. }
            | TaskStep::FinishTask => {}
        }
    }

    async fn event_posted(&self, event: &TaskEvent) {
        if let Some(message) = renderable_failure(event) {
            self.print_above(&message);
            return;
        }

        match event {
            TaskEvent::ImageBuildProgress {
                container,
                step,
                total,
                ..
            } => {
                self.set_phase(
                    container,
                    Phase::Building {
                        step: *step,
                        total: *total,
                    },
                );
            }
            TaskEvent::ImageBuilt { container, .. } => {
                self.set_phase(container, Phase::ImageReady);
            }
            TaskEvent::ImagePulled { reference, .. } => {
                let containers = self.containers_for_reference(reference);
                self.update(|state| {
                    for container in containers {
                        state.phases.insert(container, Phase::ImageReady);
                    }
                });
            }
            TaskEvent::ContainerCreated { container, .. } => {
                self.set_phase(container, Phase::Created);
            }
            TaskEvent::ContainerBecameHealthy { container } => {
                self.set_phase(container, Phase::Healthy);
            }
            TaskEvent::RunningContainerExited {
                container,
                exit_code,
            } => {
                self.update(|state| {
                    state.view = View::Cleanup;
                    state
                        .phases
                        .insert(container.clone(), Phase::Exited(*exit_code));
                });
            }
            TaskEvent::ContainerRemoved { container } => {
                self.set_phase(container, Phase::Removed);
            }
            TaskEvent::ImageBuildFailed { container, .. }
            | TaskEvent::ContainerCreationFailed { container, .. }
            | TaskEvent::ContainerStartFailed { container, .. }
            | TaskEvent::ContainerDidNotBecomeHealthy { container, .. } => {
                self.set_phase(container, Phase::Failed);
            }
            _ => {}
        }
    }
}

fn truncate_to(line: &str, width: usize) -> String {
    if width == 0 || line.chars().count() <= width {
        return line.to_string();
    }
    line.chars().take(width.saturating_sub(1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_labels() {
        assert_eq!(Phase::Pulling.label(), "pulling");
        assert_eq!(
            Phase::Building { step: 2, total: 5 }.label(),
            "building (2/5)"
        );
        assert_eq!(Phase::Building { step: 0, total: 0 }.label(), "building");
        assert_eq!(Phase::WaitingForHealthCheck.label(), "waiting for healthcheck");
        assert_eq!(Phase::Exited(0).label(), "exited (0)");
    }

    #[test]
    fn test_truncate_to_width() {
        assert_eq!(truncate_to("short", 80), "short");
        assert_eq!(truncate_to("abcdef", 4), "abc");
        assert_eq!(truncate_to("abcdef", 0), "abcdef");
    }

    fn display() -> RunDisplay {
        RunDisplay {
            task_name: "test".to_string(),
            task_container: "app".to_string(),
            dependencies: vec!["db".to_string()],
            command: Some("cargo test".to_string()),
            pull_references: [
                ("db".to_string(), "postgres:13".to_string()),
                ("app".to_string(), "app:1".to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[tokio::test]
    async fn test_startup_view_lists_every_container() {
        let logger = FancyLogger::new(Arc::new(Console::new()), display());
        logger
            .step_starting(&TaskStep::PullImage {
                reference: "postgres:13".to_string(),
            })
            .await;

        let state = logger.state.lock().expect("lock");
        let lines = logger.render_lines(&state);
        assert_eq!(lines[0], "Running task test:");
        assert!(lines.iter().any(|l| l.contains("db: pulling")));
        assert!(lines.iter().any(|l| l.contains("app: waiting")));
    }

    #[tokio::test]
    async fn test_exit_switches_to_cleanup_view() {
        let logger = FancyLogger::new(Arc::new(Console::new()), display());
        logger
            .event_posted(&TaskEvent::RunningContainerExited {
                container: "app".to_string(),
                exit_code: 0,
            })
            .await;
        logger
            .step_starting(&TaskStep::StopContainer {
                container: "db".to_string(),
                runtime_container: stevedore_core::RuntimeContainer::new("rc-db"),
            })
            .await;
        logger
            .event_posted(&TaskEvent::ContainerRemoved {
                container: "db".to_string(),
            })
            .await;

        let state = logger.state.lock().expect("lock");
        let lines = logger.render_lines(&state);
        assert_eq!(lines[0], "Cleaning up:");
        assert!(lines.iter().any(|l| l.contains("removed db")));
    }
}
