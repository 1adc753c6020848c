//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::{Container, Project};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load and validate a project file.
pub fn load_project(path: &Path) -> Result<Project, ConfigError> {
    let content = fs::read_to_string(path)?;
    let project: Project = serde_yaml::from_str(&content)?;
    validate_project(&project, path)?;
    Ok(project)
}

fn validate_project(project: &Project, path: &Path) -> Result<(), ConfigError> {
    if project.project.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "project name must not be empty".to_string(),
        ));
    }

    for (name, container) in &project.containers {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "container names must not be empty".to_string(),
            ));
        }
        validate_container(name, container, path, project)?;
    }

    for (name, task) in &project.tasks {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "task names must not be empty".to_string(),
            ));
        }
        if !project.containers.contains_key(&task.container) {
            return Err(ConfigError::Invalid(format!(
                "task '{}' refers to container '{}', which is not defined",
                name, task.container
            )));
        }
        if let Some(command) = &task.command {
            if command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "task '{}' has an empty command",
                    name
                )));
            }
        }
    }

    Ok(())
}

fn validate_container(
    name: &str,
    container: &Container,
    config_path: &Path,
    project: &Project,
) -> Result<(), ConfigError> {
    match (&container.image, &container.build) {
        (None, None) => {
            return Err(ConfigError::Invalid(format!(
                "container '{}' must set either image or build",
                name
            )));
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::Invalid(format!(
                "container '{}' sets both image and build; pick one",
                name
            )));
        }
        (Some(reference), None) if reference.trim().is_empty() => {
            return Err(ConfigError::Invalid(format!(
                "container '{}' has an empty image reference",
                name
            )));
        }
        _ => {}
    }

    if let Some(build_dir) = &container.build {
        let resolved = if build_dir.is_absolute() {
            build_dir.clone()
        } else {
            config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(build_dir)
        };
        if !resolved.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "container '{}' build directory '{}' does not exist",
                name,
                build_dir.display()
            )));
        }
    }

    if !container.build_args.is_empty() && container.build.is_none() {
        return Err(ConfigError::Invalid(format!(
            "container '{}' sets build_args without a build directory",
            name
        )));
    }

    for dependency in &container.dependencies {
        if dependency == name {
            return Err(ConfigError::Invalid(format!(
                "container '{}' depends on itself",
                name
            )));
        }
        if !project.containers.contains_key(dependency) {
            return Err(ConfigError::Invalid(format!(
                "container '{}' depends on '{}', which is not defined",
                name, dependency
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
        let path = dir.path().join("stevedore.yml");
        let mut file = fs::File::create(&path).expect("create config");
        file.write_all(yaml.as_bytes()).expect("write config");
        path
    }

    #[test]
    fn test_load_valid_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
project: demo
containers:
  db:
    image: postgres:13
    health:
      interval: 2s
      retries: 5
  app:
    image: demo-app:1
    dependencies:
      - db
tasks:
  test:
    container: app
    command: ["cargo", "test"]
"#,
        );

        let project = load_project(&path).expect("load");
        assert_eq!(project.project, "demo");
        assert_eq!(project.containers.len(), 2);
        let db = project.container("db").expect("db");
        assert_eq!(db.health.interval, Some(std::time::Duration::from_secs(2)));
        assert_eq!(db.health.retries, Some(5));
        assert_eq!(project.task("test").expect("task").container, "app");
    }

    #[test]
    fn test_rejects_missing_image_and_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
project: demo
containers:
  app: {}
tasks: {}
"#,
        );
        let err = load_project(&path).expect_err("must fail");
        assert!(err.to_string().contains("either image or build"));
    }

    #[test]
    fn test_rejects_unknown_task_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
project: demo
containers:
  app:
    image: demo:1
tasks:
  run:
    container: missing
"#,
        );
        let err = load_project(&path).expect_err("must fail");
        assert!(err.to_string().contains("not defined"));
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
project: demo
containers:
  app:
    image: demo:1
    dependencies:
      - db
tasks: {}
"#,
        );
        let err = load_project(&path).expect_err("must fail");
        assert!(err.to_string().contains("depends on 'db'"));
    }

    #[test]
    fn test_rejects_missing_build_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
project: demo
containers:
  app:
    build: ./no-such-dir
tasks: {}
"#,
        );
        let err = load_project(&path).expect_err("must fail");
        assert!(err.to_string().contains("does not exist"));
    }
}
