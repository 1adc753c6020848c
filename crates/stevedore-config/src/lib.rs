//! # Stevedore Config
//!
//! Project configuration model for stevedore:
//! - Project: the root of a `stevedore.yml` file
//! - Container: a named container definition (image or build directory)
//! - Task: a named workflow entry pointing at a task container
//!
//! Loading and validation live in [`loader`].

pub mod loader;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub use loader::{load_project, ConfigError};

/// Root of a project configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    /// Project name, used to namespace images and containers.
    pub project: String,
    #[serde(default)]
    pub containers: BTreeMap<String, Container>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
}

impl Project {
    /// Look up a container definition by name.
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.get(name)
    }

    /// Look up a task definition by name.
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }
}

/// A named container definition.
///
/// Exactly one of `image` and `build` must be set; validation enforces
/// this at load time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Container {
    /// Image reference to pull (e.g. `postgres:13`).
    #[serde(default)]
    pub image: Option<String>,
    /// Directory containing a Dockerfile to build.
    #[serde(default)]
    pub build: Option<PathBuf>,
    /// Build arguments passed to the image build.
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// Command override for the container.
    #[serde(default)]
    pub command: Option<Command>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub health: HealthCheckConfig,
    /// Run the container as the invoking user rather than the image's
    /// default user.
    #[serde(default)]
    pub run_as_current_user: bool,
    /// Names of containers that must be started and healthy first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl Container {
    /// The container's resolved image source.
    ///
    /// Callers must only invoke this after validation; a definition with
    /// neither field set falls back to an empty pull reference, which
    /// validation rejects.
    pub fn image_source(&self) -> ImageSource {
        match (&self.image, &self.build) {
            (_, Some(dir)) => ImageSource::Build {
                dir: dir.clone(),
                args: self.build_args.clone(),
            },
            (Some(reference), None) => ImageSource::Pull(reference.clone()),
            (None, None) => ImageSource::Pull(String::new()),
        }
    }
}

/// Where a container's image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Pull a published image by reference.
    Pull(String),
    /// Build an image from a local directory.
    Build {
        dir: PathBuf,
        args: BTreeMap<String, String>,
    },
}

/// A named task: the unit a user runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Name of the container the task command runs in.
    pub container: String,
    /// Command override; falls back to the container's command.
    #[serde(default)]
    pub command: Option<Command>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A command, either a shell string or an explicit argv list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Argv(Vec<String>),
}

impl Command {
    /// Resolve to the argv executed inside the container.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Command::Shell(line) => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                line.clone(),
            ],
            Command::Argv(argv) => argv.clone(),
        }
    }

    /// Human-readable rendering for progress output.
    pub fn display(&self) -> String {
        match self {
            Command::Shell(line) => line.clone(),
            Command::Argv(argv) => argv.join(" "),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Command::Shell(line) => line.trim().is_empty(),
            Command::Argv(argv) => argv.is_empty(),
        }
    }
}

/// A host-to-container port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortMapping {
    pub local: u16,
    pub container: u16,
}

/// A host-to-container volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeMount {
    pub local: PathBuf,
    pub container: String,
    /// Mount options, e.g. `cached` or `ro`.
    #[serde(default)]
    pub options: Option<String>,
}

/// Health-check timing overrides for a container.
///
/// All fields are optional; the image's own healthcheck supplies the
/// behaviour and these override its timing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default, deserialize_with = "de_duration_opt")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default, deserialize_with = "de_duration_opt")]
    pub start_period: Option<Duration>,
}

impl HealthCheckConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_RETRIES: u32 = 3;

    /// Upper bound on how long a health wait may take before the engine
    /// gives up on the container.
    pub fn wait_deadline(&self) -> Duration {
        let interval = self.interval.unwrap_or(Self::DEFAULT_INTERVAL);
        let retries = self.retries.unwrap_or(Self::DEFAULT_RETRIES);
        let start_period = self.start_period.unwrap_or(Duration::ZERO);
        start_period + interval * (retries + 1)
    }
}

/// Parse a human duration such as `500ms`, `2s` or `1m`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| format!("duration '{}' has no unit (expected ms, s or m)", raw))?;
    let (value, unit) = raw.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("duration '{}' has an invalid magnitude", raw))?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        other => return Err(format!("duration '{}' has unknown unit '{}'", raw, other)),
    };
    if !millis.is_finite() || millis < 0.0 {
        return Err(format!("duration '{}' is out of range", raw));
    }
    Ok(Duration::from_millis(millis as u64))
}

fn de_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
