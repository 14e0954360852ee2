//! Project lookup
//!
//! Resolves the project identifier a client connects with to the directory
//! its terminal runs in.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while resolving projects
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProjectError {
    #[error("Project not found: {0}")]
    NotFound(String),
}

/// A project registered in the relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectEntry {
    /// Identifier clients connect with
    pub id: String,
    /// Display name; defaults to the id
    #[serde(default)]
    pub name: Option<String>,
    /// Working directory
    pub path: PathBuf,
}

/// A resolved project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub display_name: String,
    pub working_directory: PathBuf,
}

/// Source of project working directories
pub trait ProjectStore: Send + Sync {
    /// Resolve a project identifier
    fn resolve(&self, project_id: &str) -> Result<Project, ProjectError>;
}

/// Projects from configuration, falling back to subdirectories of a root
#[derive(Debug, Clone, Default)]
pub struct ProjectCatalog {
    entries: HashMap<String, ProjectEntry>,
    root: Option<PathBuf>,
}

impl ProjectCatalog {
    /// Create a catalog from configured entries and an optional projects root
    pub fn new(entries: Vec<ProjectEntry>, root: Option<PathBuf>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
            root,
        }
    }

    /// Number of explicitly registered projects
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve_in_root(&self, project_id: &str) -> Option<Project> {
        let root = self.root.as_ref()?;
        if !is_plain_name(project_id) {
            return None;
        }
        let dir = root.join(project_id);
        if !dir.is_dir() {
            return None;
        }
        Some(Project {
            id: project_id.to_string(),
            display_name: project_id.to_string(),
            working_directory: dir,
        })
    }
}

impl ProjectStore for ProjectCatalog {
    fn resolve(&self, project_id: &str) -> Result<Project, ProjectError> {
        if let Some(entry) = self.entries.get(project_id) {
            return Ok(Project {
                id: entry.id.clone(),
                display_name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
                working_directory: entry.path.clone(),
            });
        }

        self.resolve_in_root(project_id)
            .ok_or_else(|| ProjectError::NotFound(project_id.to_string()))
    }
}

/// True when `name` is a single normal path component
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
