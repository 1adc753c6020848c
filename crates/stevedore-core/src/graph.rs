//! Dependency graph resolution.
//!
//! Resolved once at task entry: nodes are the containers reachable from
//! the task container via `dependencies`, with the task container
//! flagged. Guarantees acyclicity and that every named dependency exists.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;

use stevedore_config::{Container, Project, Task};

/// Dependency graph resolution errors.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("container dependencies form a cycle: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
    #[error("container '{from}' depends on '{name}', which is not defined")]
    UnknownDependency { from: String, name: String },
    #[error("task container '{0}' is not defined")]
    UnknownContainer(String),
}

/// The containers involved in one task run and their dependency edges.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    task_container: String,
    nodes: BTreeMap<String, Container>,
    /// Reverse edges: container -> containers that depend on it.
    dependents: HashMap<String, BTreeSet<String>>,
    /// Topological order, dependencies before dependents.
    order: Vec<String>,
}

impl DependencyGraph {
    /// Resolve the subgraph reachable from `task`'s container.
    pub fn resolve(project: &Project, task: &Task) -> Result<Self, GraphError> {
        let task_container = task.container.clone();
        if !project.containers.contains_key(&task_container) {
            return Err(GraphError::UnknownContainer(task_container));
        }

        let mut nodes = BTreeMap::new();
        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut order = Vec::new();
        let mut visiting = Vec::new();
        let mut visited = HashSet::new();

        collect(
            project,
            &task_container,
            &mut nodes,
            &mut dependents,
            &mut order,
            &mut visiting,
            &mut visited,
        )?;

        Ok(Self {
            task_container,
            nodes,
            dependents,
            order,
        })
    }

    pub fn task_container(&self) -> &str {
        &self.task_container
    }

    pub fn is_task_container(&self, name: &str) -> bool {
        self.task_container == name
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Container names in dependency order, leaves first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// The containers `name` depends on directly.
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|c| c.dependencies.iter().map(String::as_str))
    }

    /// The containers that directly depend on `name`.
    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Dependency container names (everything except the task container),
    /// leaves first.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .map(String::as_str)
            .filter(move |name| *name != self.task_container)
    }
}

fn collect(
    project: &Project,
    name: &str,
    nodes: &mut BTreeMap<String, Container>,
    dependents: &mut HashMap<String, BTreeSet<String>>,
    order: &mut Vec<String>,
    visiting: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> Result<(), GraphError> {
    if let Some(position) = visiting.iter().position(|n| n == name) {
        let mut cycle: Vec<String> = visiting[position..].to_vec();
        cycle.push(name.to_string());
        return Err(GraphError::CyclicDependency(cycle));
    }
    if visited.contains(name) {
        return Ok(());
    }

    let container = project
        .containers
        .get(name)
        .ok_or_else(|| GraphError::UnknownDependency {
            from: visiting.last().cloned().unwrap_or_default(),
            name: name.to_string(),
        })?;

    visiting.push(name.to_string());
    for dependency in &container.dependencies {
        dependents
            .entry(dependency.clone())
            .or_default()
            .insert(name.to_string());
        collect(project, dependency, nodes, dependents, order, visiting, visited)?;
    }
    visiting.pop();

    visited.insert(name.to_string());
    nodes.insert(name.to_string(), container.clone());
    // Post-order insertion yields dependencies before dependents.
    order.push(name.to_string());
    Ok(())
}
