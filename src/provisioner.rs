//! Source checkout, image build and container start for a descriptor

use crate::descriptor::{HostDescriptor, IdentityKey};
use crate::runner::{CommandError, CommandRunner, RunOutcome};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("checkout of {key} failed: {source}")]
    Checkout {
        key: IdentityKey,
        #[source]
        source: CommandError,
    },
    #[error("image build for {key} failed: {source}")]
    Build {
        key: IdentityKey,
        #[source]
        source: CommandError,
    },
    #[error("starting container {key} failed: {source}")]
    Run {
        key: IdentityKey,
        #[source]
        source: CommandError,
    },
}

/// What a successful `ensure_running` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub container_name: String,
    pub image_tag: String,
    pub head_commit: String,
    /// False when the image for this head commit was already built
    pub built: bool,
    pub outcome: RunOutcome,
}

/// Brings the container for a descriptor into the running state.
///
/// Calling `ensure_running` repeatedly for the same identity converges: the
/// repository is cloned once, the image is rebuilt only when the checked out
/// commit changes, and an existing container is reused.
pub struct Provisioner {
    runner: Arc<dyn CommandRunner>,
    source_dir: PathBuf,
    clone_scheme: String,
    /// Last head commit built per identity
    built: DashMap<IdentityKey, String>,
}

impl Provisioner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        source_dir: impl Into<PathBuf>,
        clone_scheme: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            source_dir: source_dir.into(),
            clone_scheme: clone_scheme.into(),
            built: DashMap::new(),
        }
    }

    pub async fn ensure_running(
        &self,
        descriptor: &HostDescriptor,
    ) -> Result<ProvisionReport, ProvisionError> {
        let key = descriptor.identity();
        let dir = key.checkout_path(&self.source_dir);

        self.checkout(&key, &dir)
            .await
            .map_err(|source| ProvisionError::Checkout {
                key: key.clone(),
                source,
            })?;

        let head_commit = self
            .runner
            .head_commit(&dir)
            .await
            .map_err(|source| ProvisionError::Checkout {
                key: key.clone(),
                source,
            })?;

        if let Some(pinned) = &descriptor.commit {
            if !head_commit.starts_with(pinned.as_str()) {
                warn!(
                    key = %key,
                    pinned = %pinned,
                    head = %head_commit,
                    "Checked out commit differs from the pinned commit"
                );
            }
        }

        let image_tag = key.image_tag();
        let up_to_date = self
            .built
            .get(&key)
            .map(|built| *built == head_commit)
            .unwrap_or(false);

        if up_to_date {
            debug!(image = %image_tag, head = %head_commit, "Image already built for head commit");
        } else {
            info!(image = %image_tag, head = %head_commit, "Building image");
            self.runner
                .build_image(&image_tag, &dir)
                .await
                .map_err(|source| ProvisionError::Build {
                    key: key.clone(),
                    source,
                })?;
            self.built.insert(key.clone(), head_commit.clone());
        }

        let container_name = key.container_name();
        let outcome = self
            .runner
            .run_container(&container_name, &image_tag)
            .await
            .map_err(|source| ProvisionError::Run {
                key: key.clone(),
                source,
            })?;

        info!(container = %container_name, ?outcome, "Container ready");

        Ok(ProvisionReport {
            container_name,
            image_tag,
            head_commit,
            built: !up_to_date,
            outcome,
        })
    }

    async fn checkout(&self, key: &IdentityKey, dir: &Path) -> Result<(), CommandError> {
        if self.runner.has_checkout(dir).await {
            debug!(dir = %dir.display(), refspec = %key.refspec, "Updating checkout");
            self.runner.fetch_and_checkout(dir, &key.refspec).await
        } else {
            let url = key.clone_url(&self.clone_scheme);
            info!(url = %url, refspec = %key.refspec, dir = %dir.display(), "Cloning repository");
            self.runner.clone_shallow(&url, &key.refspec, dir).await
        }
    }
}
