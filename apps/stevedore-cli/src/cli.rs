use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stevedore_config::{load_project, ImageSource, Project, Task};
use stevedore_core::{
    AfterFailure, DependencyGraph, Dispatcher, RunOptions, RunOutcome, StepRunner, TaskContext,
};
use stevedore_docker::DockerCli;
use stevedore_ui::{select_logger, Console, OutputMode, RunDisplay};

/// Exit code for configuration and usage errors.
const CONFIG_ERROR_EXIT_CODE: i32 = 64;
/// Exit code for dependency graph errors (cycles, unknown names).
const GRAPH_ERROR_EXIT_CODE: i32 = 65;

#[derive(Debug, Parser)]
#[command(
    name = "stevedore",
    about = "Run developer workflow tasks in ephemeral containers",
    version
)]
pub struct Cli {
    /// Name of the task to run.
    #[arg(value_name = "TASK", required_unless_present = "list_tasks")]
    task: Option<String>,

    /// Path to the project configuration file.
    #[arg(long, short = 'f', default_value = "stevedore.yml")]
    config_file: PathBuf,

    /// List the tasks defined in the project file and exit.
    #[arg(long)]
    list_tasks: bool,

    /// Only print errors.
    #[arg(long, conflicts_with = "simple_output")]
    quiet: bool,

    /// Force plain line-per-event output.
    #[arg(long)]
    simple_output: bool,

    /// Leave containers and the task network behind when the run fails,
    /// printing the commands to remove them manually.
    #[arg(long)]
    no_cleanup_after_failure: bool,

    /// Do not pass the host's proxy environment variables to containers.
    #[arg(long)]
    no_proxy_vars: bool,

    /// Maximum number of concurrently executing steps.
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Enable debug logging and dump the event journal at the end.
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    pub async fn run(self) -> i32 {
        init_tracing(self.verbose);
        let console = Arc::new(Console::new());

        let project = match load_project(&self.config_file) {
            Ok(project) => project,
            Err(e) => {
                console.println(&format!(
                    "Could not load {}: {}",
                    self.config_file.display(),
                    e
                ));
                return CONFIG_ERROR_EXIT_CODE;
            }
        };

        if self.list_tasks {
            list_tasks(&console, &project);
            return 0;
        }

        let Some(task_name) = self.task.as_deref() else {
            console.println("No task given.");
            return CONFIG_ERROR_EXIT_CODE;
        };
        let Some(task) = project.task(task_name) else {
            console.println(&format!(
                "The task '{}' is not defined in {}.",
                task_name,
                self.config_file.display()
            ));
            return CONFIG_ERROR_EXIT_CODE;
        };

        let graph = match DependencyGraph::resolve(&project, task) {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                console.println(&format!("Could not run the task '{}': {}", task_name, e));
                return GRAPH_ERROR_EXIT_CODE;
            }
        };

        let display = run_display(task_name, task, &graph);
        let mode = if self.quiet {
            OutputMode::Quiet
        } else if self.simple_output {
            OutputMode::Simple
        } else {
            OutputMode::Auto
        };
        let logger = select_logger(mode, console.clone(), display);

        let options = RunOptions {
            after_failure: if self.no_cleanup_after_failure {
                AfterFailure::DontCleanup
            } else {
                AfterFailure::Cleanup
            },
            propagate_proxy_env: !self.no_proxy_vars,
            task_command: task.command.as_ref().map(|c| c.to_argv()),
        };

        let runtime = Arc::new(DockerCli::new());
        let runner = Arc::new(StepRunner::new(
            runtime,
            graph.clone(),
            project.project.clone(),
            options.propagate_proxy_env,
            console.stdin_is_tty(),
        ));
        let mut dispatcher = Dispatcher::new(runner, logger);
        if let Some(max_parallel) = self.max_parallel {
            dispatcher = dispatcher.with_max_parallel(max_parallel);
        }

        let mut ctx = TaskContext::new(graph, options);
        let outcome = dispatcher.run(&mut ctx).await;

        if self.verbose {
            for record in ctx.journal() {
                tracing::debug!(at = %record.at, event = ?record.event, "journal");
            }
        }

        if outcome == RunOutcome::Failed {
            console.println(&format!(
                "The task {} failed. See above for details.",
                task_name
            ));
        }
        outcome.exit_code()
    }
}

fn list_tasks(console: &Console, project: &Project) {
    console.print_bold(&format!("Tasks in project '{}':", project.project));
    for (name, task) in &project.tasks {
        match &task.description {
            Some(description) => console.println(&format!("  {} - {}", name, description)),
            None => console.println(&format!("  {}", name)),
        }
    }
}

fn run_display(task_name: &str, task: &Task, graph: &DependencyGraph) -> RunDisplay {
    let command = task
        .command
        .as_ref()
        .or_else(|| {
            graph
                .container(graph.task_container())
                .and_then(|c| c.command.as_ref())
        })
        .map(|c| c.display());

    let mut pull_references = BTreeMap::new();
    for name in graph.names() {
        if let Some(container) = graph.container(name) {
            if let ImageSource::Pull(reference) = container.image_source() {
                pull_references.insert(name.to_string(), reference);
            }
        }
    }

    RunDisplay {
        task_name: task_name.to_string(),
        task_container: graph.task_container().to_string(),
        dependencies: graph.dependency_names().map(str::to_string).collect(),
        command,
        pull_references,
    }
}

fn init_tracing(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
