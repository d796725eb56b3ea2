//! Configuration loading and runner construction.
//!
//! Providers, runs, judges and tools come from one YAML document; tasks come
//! from a second one. The schema types live in [`schema`]; this module owns
//! file loading only.

pub mod schema;

pub use schema::{Config, TaskFile};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::task::Task;

/// Loads the provider/judge/tool configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content)
}

/// Loads the configuration from a YAML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Loads and resolves the task list from a YAML file. Relative file URIs in
/// task attachments resolve against the file's directory.
pub fn load_tasks(path: &Path) -> Result<Vec<Arc<Task>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file: {}", path.display()))?;
    let file: TaskFile = serde_yml::from_str(&content)
        .with_context(|| format!("failed to parse task file: {}", path.display()))?;
    file.resolve(path.parent())
}

/// Loads and resolves tasks from a YAML string.
pub fn load_tasks_str(content: &str) -> Result<Vec<Arc<Task>>> {
    let file: TaskFile = serde_yml::from_str(content).context("failed to parse tasks")?;
    file.resolve(None)
}
