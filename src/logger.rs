//! The container logger contract.
//!
//! The logger decides where a container's stdout and stderr go (sandbox
//! files, rotation, journald, ...). The engine asks it for sinks right
//! before forking and tells it about recovered executors on restart.

use crate::config::ExecutorSpec;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Destination for one of the child's output streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IoSink {
    /// Inherit the engine's own stream.
    Inherit,
    /// Append to a file, typically inside the sandbox.
    Path { path: PathBuf },
}

/// Stdio destinations for a forked entry process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprocessIo {
    pub stdout: IoSink,
    pub stderr: IoSink,
}

impl SubprocessIo {
    /// Sinks appending to `stdout`/`stderr` files under `directory`.
    #[must_use]
    pub fn sandbox(directory: &Path) -> Self {
        Self {
            stdout: IoSink::Path {
                path: directory.join("stdout"),
            },
            stderr: IoSink::Path {
                path: directory.join("stderr"),
            },
        }
    }
}

/// The component that routes container output.
#[async_trait]
pub trait ContainerLogger: Send + Sync {
    /// Re-attaches to the output of a recovered executor. Failures here
    /// are logged by the engine, not propagated.
    async fn recover(&self, _executor: &ExecutorSpec, _directory: &Path) -> Result<()> {
        Ok(())
    }

    /// Produces the stdio sinks for a container about to be forked.
    async fn prepare(&self, executor: Option<&ExecutorSpec>, directory: &Path)
        -> Result<SubprocessIo>;
}
