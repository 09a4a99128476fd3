//! Client identity.

use std::path::PathBuf;

use crate::project::Project;

/// Identifies the client a traversal runs on behalf of.
///
/// Multiple clients may drive compilations concurrently; the scheduler
/// deduplicates equivalent work across them and keeps the client-facing
/// classes directories separate through
/// [`ClientInfo::unique_classes_dir_for`].
pub trait ClientInfo: Send + Sync {
    /// A stable identifier for this client connection.
    fn client_id(&self) -> &str;

    /// The externally visible classes directory for `project`, stable for
    /// the lifetime of this client.
    fn unique_classes_dir_for(&self, project: &Project) -> PathBuf;
}
