//! The fetcher contract.
//!
//! The fetcher downloads a command's URIs into the sandbox before the
//! entry process is released. Fetches are killable so a destroy during
//! the fetch phase does not hang on a stuck download.

use crate::config::CommandSpec;
use crate::error::Result;
use crate::id::ContainerId;
use async_trait::async_trait;
use std::path::Path;

/// The component that places a command's artifacts into the sandbox.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `command.uris` into `directory`, optionally as `user`.
    async fn fetch(
        &self,
        id: &ContainerId,
        command: &CommandSpec,
        directory: &Path,
        user: Option<&str>,
        slave_id: &str,
    ) -> Result<()>;

    /// Aborts an in-flight fetch for `id`, if any.
    fn kill(&self, id: &ContainerId);
}
