//! # Stevedore Core
//!
//! The execution engine: converts a resolved dependency graph into a
//! stream of concrete steps, dispatches them concurrently, consumes the
//! events they emit and decides what becomes runnable next.
//!
//! Layered bottom-up:
//! - [`graph`]: dependency graph resolution (cycle/unknown detection)
//! - [`event`] / [`step`]: the event and step taxonomies
//! - [`context`]: per-run event journal, typed indexes and ready queue
//! - [`state`]: the reducer holding all orchestration policy
//! - [`runtime`]: the container-runtime adapter interface
//! - [`runner`]: step execution against the runtime adapter
//! - [`dispatch`]: the bounded worker pool and single-writer drain loop
//!
//! This crate does NOT care about:
//! - How the project file is parsed (stevedore-config)
//! - Which container CLI backs the runtime adapter (stevedore-docker)
//! - How progress is rendered (stevedore-ui)

pub mod context;
pub mod dispatch;
pub mod event;
pub mod graph;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod step;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::context::{AfterFailure, RecordedEvent, RunOptions, TaskContext};
    pub use crate::dispatch::{
        Dispatcher, EventLogger, NullEventLogger, RunOutcome, ORCHESTRATION_FAILURE_EXIT_CODE,
    };
    pub use crate::event::TaskEvent;
    pub use crate::graph::{DependencyGraph, GraphError};
    pub use crate::runner::StepRunner;
    pub use crate::runtime::{
        ContainerRuntime, CreateContainerRequest, HealthCheckLogEntry, LineControl,
        RemovalOutcome, RuntimeContainer, RuntimeError, RuntimeImage, RuntimeNetwork,
    };
    pub use crate::step::TaskStep;
}

pub use context::{AfterFailure, RunOptions, TaskContext};
pub use dispatch::{
    Dispatcher, EventLogger, NullEventLogger, RunOutcome, ORCHESTRATION_FAILURE_EXIT_CODE,
};
pub use event::TaskEvent;
pub use graph::{DependencyGraph, GraphError};
pub use runner::StepRunner;
pub use runtime::{
    ContainerRuntime, CreateContainerRequest, HealthCheckLogEntry, LineControl, RemovalOutcome,
    RuntimeContainer, RuntimeError, RuntimeImage, RuntimeNetwork,
};
pub use step::TaskStep;
