//! The deduplication key: a fingerprint of semantically relevant inputs.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;

/// A fingerprint of all semantically relevant inputs to a compilation.
///
/// Two concurrent compile requests with equal fingerprints are the same
/// logical work and are deduplicated against each other. The fingerprint is
/// opaque to the scheduler: equality and hashing are the whole contract, and
/// both are stable for the lifetime of the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueCompileInputs {
    project_id: String,
    digest: u64,
}

impl UniqueCompileInputs {
    /// Creates a fingerprint from a precomputed digest.
    pub fn new(project_id: impl Into<String>, digest: u64) -> Self {
        Self { project_id: project_id.into(), digest }
    }

    /// Computes a fingerprint from the raw input parts.
    ///
    /// `sources` pairs each source path with its content hash; `classpath`
    /// carries the entry hashes in classpath order; `options` are the
    /// compiler options that affect output.
    pub fn from_parts(
        project_id: impl Into<String>,
        sources: &[(PathBuf, u64)],
        classpath: &[u64],
        options: &[String],
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        for (path, hash) in sources {
            path.hash(&mut hasher);
            hash.hash(&mut hasher);
        }
        classpath.hash(&mut hasher);
        options.hash(&mut hasher);
        Self { project_id: project_id.into(), digest: hasher.finish() }
    }

    /// The id of the project these inputs compile.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The input digest.
    pub const fn digest(&self) -> u64 {
        self.digest
    }
}
