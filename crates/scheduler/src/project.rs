//! Build unit identity.

use std::sync::Arc;

use kiln_graph::Dag;

/// A build unit, immutable for the lifetime of a build.
///
/// Projects are compared by [`Project::unique_id`], which is stable across
/// build-file reloads; `name` is the human-facing label used in reporter
/// events and `Blocked` causes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Project {
    /// The stable identifier of this project.
    pub unique_id: String,
    /// The human-readable name of this project.
    pub name: String,
    /// The names of the projects this project depends on.
    pub dependencies: Vec<String>,
}

impl Project {
    /// Creates a new project with no dependencies.
    pub fn new(unique_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { unique_id: unique_id.into(), name: name.into(), dependencies: Vec::new() }
    }

    /// Sets the dependency list of this project.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// A DAG of projects, the input shape of a traversal request.
pub type ProjectDag = Dag<Arc<Project>>;
