//! # Stevedore Docker
//!
//! The Docker CLI runtime adapter: implements the engine's
//! [`ContainerRuntime`](stevedore_core::ContainerRuntime) capability set
//! by driving the `docker` binary as a subprocess. The daemon is treated
//! as shared, thread-safe, external state; every call spawns a fresh
//! process with `kill_on_drop` so engine cancellation reaps it.

mod client;

pub use client::DockerCli;
