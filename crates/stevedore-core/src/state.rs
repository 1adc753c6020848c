//! The state machine: all orchestration policy, as a reducer.
//!
//! `apply` reads one event plus the context and does exactly two things:
//! enqueue further steps and flip the abort flag. It never touches the
//! runtime. Handlers are re-entrancy safe; the same predicate being
//! satisfied twice (two events arriving close together) produces no
//! duplicate work because the context suppresses steps by key.

use stevedore_config::ImageSource;

use crate::context::{AfterFailure, TaskContext};
use crate::event::TaskEvent;
use crate::step::TaskStep;

/// Apply one observed event to the run state.
pub fn apply(event: &TaskEvent, ctx: &mut TaskContext) {
    match event {
        TaskEvent::TaskStarted => on_task_started(ctx),
        TaskEvent::ImageBuilt { container, .. } => maybe_create_container(ctx, container),
        TaskEvent::ImagePulled { reference, .. } => on_image_pulled(ctx, reference),
        TaskEvent::TaskNetworkCreated { .. } => on_network_created(ctx),
        TaskEvent::ContainerCreated {
            container,
            runtime_container,
        } => on_container_created(ctx, container, runtime_container.clone()),
        TaskEvent::ContainerStarted { container } => on_container_started(ctx, container),
        TaskEvent::ContainerBecameHealthy { container } => on_container_healthy(ctx, container),
        TaskEvent::RunningContainerExited { container, .. } => on_container_exited(ctx, container),
        TaskEvent::ContainerStopped { container } => on_container_stopped(ctx, container),
        TaskEvent::ContainerRemoved { container } => on_container_removed(ctx, container),
        TaskEvent::TaskNetworkDeleted => ctx.queue_step(TaskStep::FinishTask),

        // Post-run failures: reported, but cleanup continues.
        TaskEvent::TaskNetworkDeletionFailed { .. } => ctx.queue_step(TaskStep::FinishTask),
        TaskEvent::ContainerStopFailed { container, .. } => on_stop_failed(ctx, container),
        TaskEvent::ContainerRemovalFailed { .. } => converge(ctx),
        TaskEvent::TemporaryFileDeletionFailed { .. } => {}

        // Pre-run failures abort the run.
        TaskEvent::ContainerCreationFailed { container, .. } => {
            schedule_temp_file_cleanup(ctx, container);
            on_aborting_failure(ctx, event);
        }
        TaskEvent::ImageBuildFailed { .. }
        | TaskEvent::ImagePullFailed { .. }
        | TaskEvent::TaskNetworkCreationFailed { .. }
        | TaskEvent::ContainerStartFailed { .. }
        | TaskEvent::ContainerDidNotBecomeHealthy { .. } => on_aborting_failure(ctx, event),

        TaskEvent::ImageBuildProgress { .. }
        | TaskEvent::TemporaryFileCreated { .. }
        | TaskEvent::TemporaryFileDeleted { .. }
        | TaskEvent::TaskFinished => {}
    }
}

/// Enqueue image acquisition for every container in the graph, plus the
/// task network. Pulls of the same reference collapse into one step.
fn on_task_started(ctx: &mut TaskContext) {
    let sources: Vec<(String, ImageSource)> = ctx
        .graph()
        .names()
        .filter_map(|name| {
            ctx.graph()
                .container(name)
                .map(|c| (name.to_string(), c.image_source()))
        })
        .collect();

    for (name, source) in sources {
        match source {
            ImageSource::Build { .. } => ctx.queue_step(TaskStep::BuildImage { container: name }),
            ImageSource::Pull(reference) => ctx.queue_step(TaskStep::PullImage { reference }),
        }
    }

    ctx.queue_step(TaskStep::CreateTaskNetwork);
}

fn on_image_pulled(ctx: &mut TaskContext, reference: &str) {
    let matching: Vec<String> = ctx
        .graph()
        .names()
        .filter(|name| {
            ctx.graph()
                .container(name)
                .map(|c| c.image_source() == ImageSource::Pull(reference.to_string()))
                .unwrap_or(false)
        })
        .map(str::to_string)
        .collect();
    for name in matching {
        maybe_create_container(ctx, &name);
    }
}

fn on_network_created(ctx: &mut TaskContext) {
    let names: Vec<String> = ctx.graph().names().map(str::to_string).collect();
    for name in names {
        maybe_create_container(ctx, &name);
    }
}

/// Create the container once its image and the task network both exist.
fn maybe_create_container(ctx: &mut TaskContext, name: &str) {
    if ctx.is_aborting() {
        return;
    }
    let Some(network) = ctx.network().cloned() else {
        return;
    };
    let Some(image) = ctx.image_ready_for(name).cloned() else {
        return;
    };
    let command = ctx.command_for(name);
    ctx.queue_step(TaskStep::CreateContainer {
        container: name.to_string(),
        image,
        network,
        command,
    });
}

fn on_container_created(
    ctx: &mut TaskContext,
    name: &str,
    runtime_container: crate::runtime::RuntimeContainer,
) {
    if ctx.is_aborting() {
        // The run failed while this create was in flight; the new
        // container goes straight into teardown.
        match ctx.after_failure() {
            AfterFailure::Cleanup => ctx.queue_step(TaskStep::CleanUpContainer {
                container: name.to_string(),
                runtime_container,
            }),
            AfterFailure::DontCleanup => {
                ctx.queue_step(TaskStep::DisplayTaskFailure {
                    message: manual_container_removal_message(ctx, name, &runtime_container),
                });
                converge(ctx);
            }
        }
        return;
    }
    maybe_start_or_run(ctx, name);
}

fn on_container_started(ctx: &mut TaskContext, name: &str) {
    let Some(runtime_container) = ctx.runtime_container(name).cloned() else {
        tracing::warn!(container = name, "started container has no creation record");
        return;
    };
    ctx.queue_step(TaskStep::WaitForHealth {
        container: name.to_string(),
        runtime_container,
    });
}

fn on_container_healthy(ctx: &mut TaskContext, name: &str) {
    let dependents: Vec<String> = ctx.graph().dependents_of(name).map(str::to_string).collect();
    for dependent in dependents {
        maybe_start_or_run(ctx, &dependent);
    }
}

/// Start (or run, for the task container) once the container exists and
/// every dependency is healthy.
fn maybe_start_or_run(ctx: &mut TaskContext, name: &str) {
    if ctx.is_aborting() {
        return;
    }
    let Some(runtime_container) = ctx.runtime_container(name).cloned() else {
        return;
    };
    if !ctx.all_dependencies_healthy(name) {
        return;
    }
    if ctx.is_task_container(name) {
        ctx.queue_step(TaskStep::RunContainer {
            container: name.to_string(),
            runtime_container,
        });
    } else {
        ctx.queue_step(TaskStep::StartContainer {
            container: name.to_string(),
            runtime_container,
        });
    }
}

/// The task container exited: stop it and every started dependency; each
/// stop chains into a removal, and removals converge on network teardown.
fn on_container_exited(ctx: &mut TaskContext, name: &str) {
    let mut to_stop = vec![name.to_string()];
    to_stop.extend(ctx.started_dependencies());
    for container in to_stop {
        let Some(runtime_container) = ctx.runtime_container(&container).cloned() else {
            continue;
        };
        ctx.queue_step(TaskStep::StopContainer {
            container,
            runtime_container,
        });
    }
}

fn on_container_stopped(ctx: &mut TaskContext, name: &str) {
    let Some(runtime_container) = ctx.runtime_container(name).cloned() else {
        return;
    };
    ctx.queue_step(TaskStep::RemoveContainer {
        container: name.to_string(),
        runtime_container,
    });
}

fn on_container_removed(ctx: &mut TaskContext, name: &str) {
    schedule_temp_file_cleanup(ctx, name);
    converge(ctx);
}

/// Stop failed: fall back to a force-remove so the run still converges.
fn on_stop_failed(ctx: &mut TaskContext, name: &str) {
    let Some(runtime_container) = ctx.runtime_container(name).cloned() else {
        return;
    };
    ctx.queue_step(TaskStep::CleanUpContainer {
        container: name.to_string(),
        runtime_container,
    });
}

fn schedule_temp_file_cleanup(ctx: &mut TaskContext, name: &str) {
    for path in ctx.temp_files_for(name) {
        ctx.queue_step(TaskStep::DeleteTemporaryFile { path });
    }
}

/// A pre-run failure: flip the abort flag, withdraw pending creates,
/// surface the failure, and tear down whatever exists.
fn on_aborting_failure(ctx: &mut TaskContext, event: &TaskEvent) {
    let first_failure = !ctx.is_aborting();
    ctx.mark_aborting();
    if first_failure {
        ctx.cancel_pending_startup_steps();
    }

    if let Some(description) = event.failure_description() {
        ctx.queue_step(TaskStep::DisplayTaskFailure {
            message: description,
        });
    }

    let created: Vec<(String, crate::runtime::RuntimeContainer)> = ctx
        .created_containers()
        .map(|(name, rc)| (name.to_string(), rc.clone()))
        .collect();

    match ctx.after_failure() {
        AfterFailure::Cleanup => {
            for (name, runtime_container) in created {
                if ctx.is_removed(&name) || ctx.removal_requested(&name) {
                    continue;
                }
                ctx.queue_step(TaskStep::CleanUpContainer {
                    container: name,
                    runtime_container,
                });
            }
        }
        AfterFailure::DontCleanup => {
            for (name, runtime_container) in created {
                let message = manual_container_removal_message(ctx, &name, &runtime_container);
                ctx.queue_step(TaskStep::DisplayTaskFailure { message });
            }
        }
    }

    converge(ctx);
}

/// Decide whether teardown is complete: once every create attempt has
/// settled, delete the task network (when it exists and nothing is left
/// attached to it) and otherwise finish the task.
fn converge(ctx: &mut TaskContext) {
    if !ctx.all_create_attempts_settled() || ctx.network_attempt_outstanding() {
        return;
    }

    let leftovers = ctx.is_aborting()
        && ctx.after_failure() == AfterFailure::DontCleanup
        && ctx.created_containers().any(|(name, _)| !ctx.is_removed(name));

    match ctx.network().cloned() {
        Some(network) if !ctx.network_deleted() && !leftovers => {
            ctx.queue_step(TaskStep::DeleteTaskNetwork { network });
        }
        Some(network) if !ctx.network_deleted() => {
            // Containers were left behind for inspection; the network
            // stays with them.
            ctx.queue_step(TaskStep::DisplayTaskFailure {
                message: format!(
                    "The task network was not removed. Remove it yourself once the remaining containers are gone: docker network rm {}",
                    network
                ),
            });
            ctx.queue_step(TaskStep::FinishTask);
        }
        _ => ctx.queue_step(TaskStep::FinishTask),
    }
}

fn manual_container_removal_message(
    ctx: &TaskContext,
    name: &str,
    runtime_container: &crate::runtime::RuntimeContainer,
) -> String {
    let mut message = format!(
        "The container '{}' was not removed. Remove it yourself: docker rm --force {}",
        name, runtime_container
    );
    for path in ctx.temp_files_for(name) {
        message.push_str(&format!(
            "\nIt also left a temporary file behind: rm {}",
            path.display()
        ));
    }
    message
}
