//! The provisioner contract.
//!
//! The provisioner materializes a root filesystem from a container image
//! (registry pull, layer union) and destroys it on teardown. The engine
//! only sees the resulting rootfs path plus the image manifest.

use crate::config::Image;
use crate::error::Result;
use crate::id::ContainerId;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;

/// Result of provisioning an image for one container.
///
/// At most one manifest may be present; carrying both is a launch failure.
#[derive(Debug, Clone, Default)]
pub struct ProvisionInfo {
    pub rootfs: PathBuf,
    pub docker_manifest: Option<serde_json::Value>,
    pub appc_manifest: Option<serde_json::Value>,
}

/// The component that turns container images into root filesystems.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Reconciles provisioned rootfses with the set of containers known
    /// after recovery; anything else is garbage to collect.
    async fn recover(&self, known: &HashSet<ContainerId>) -> Result<()>;

    /// Materializes a rootfs for `id` from `image`.
    async fn provision(&self, id: &ContainerId, image: &Image) -> Result<ProvisionInfo>;

    /// Destroys the rootfs provisioned for `id`. Returns `false` when
    /// there was nothing to destroy.
    async fn destroy(&self, id: &ContainerId) -> Result<bool>;
}
