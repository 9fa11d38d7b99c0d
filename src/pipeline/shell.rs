//! Targets built on a remote machine over an interactive session.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use super::{Pipeline, StageError, StageFuture, TargetProfile};
use crate::context::FleetContext;
use crate::fs;
use crate::shell::{Connector, RemoteShellSession, ShellOutput};

/// Pipeline of a target driven by a [`TargetProfile`].
pub struct ShellPipeline<C: Connector> {
    target: String,
    profile: TargetProfile,
    session: RemoteShellSession<C>,
    context: Arc<FleetContext>,
}

impl<C: Connector> std::fmt::Debug for ShellPipeline<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellPipeline")
            .field("target", &self.target)
            .field("address", &self.session.credentials().address)
            .field("state", &self.session.state())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ShellPipeline<C> {
    /// Creates the pipeline of `target`, reaching its machine through
    /// `session`.
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        profile: TargetProfile,
        session: RemoteShellSession<C>,
        context: Arc<FleetContext>,
    ) -> Self {
        Self {
            target: target.into(),
            profile,
            session,
            context,
        }
    }

    /// Local patched source tree of this target.
    #[must_use]
    pub fn patched_dir(&self) -> Utf8PathBuf {
        self.context.config().patched_root().join(&self.target)
    }

    /// Local artifact directory of this target.
    #[must_use]
    pub fn artifacts_dir(&self) -> Utf8PathBuf {
        self.context.config().artifacts_root().join(&self.target)
    }

    async fn patch(&mut self) -> Result<(), StageError> {
        let destination = self.patched_dir();
        fs::remove_dir_all(&destination)?;
        let patches = self.context.config().patches_root().join(&self.profile.patch_dir);
        let vcs = self.context.vcs().await?;
        let snapshot = vcs.snapshot_with_overlay(&destination, &patches).await?;
        info!(path = %snapshot.path(), "patched source ready");
        Ok(())
    }

    async fn push(&mut self) -> Result<(), StageError> {
        if !self.profile.prepare_commands.is_empty() {
            let output = self.session.run_batch(&self.profile.prepare_commands).await?;
            ensure_complete(&output)?;
        }
        let source = contents_of(&self.patched_dir());
        self.session
            .copy_to_remote(&source, &self.profile.remote_source_dir)
            .await?;
        Ok(())
    }

    async fn build_packages(&mut self) -> Result<(), StageError> {
        let output = self.session.run_batch(&self.profile.build_commands).await?;
        ensure_complete(&output)?;
        if let Some(marker) = self.profile.failure_in(&output.text) {
            return Err(StageError::FailureMarker {
                marker: marker.to_owned(),
            });
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<(), StageError> {
        let destination = self.artifacts_dir();
        fs::reset_dir(&destination)?;
        let remote = format!("{}/", self.profile.remote_artifacts_dir.trim_end_matches('/'));
        self.session.copy_from_remote(&remote, &destination).await?;
        info!(path = %destination, "artifacts fetched");
        Ok(())
    }

    async fn run_tests(&mut self) -> Result<(), StageError> {
        if self.profile.test_commands.is_empty() {
            info!(target_name = %self.target, "no test procedure for this target");
            return Ok(());
        }
        let output = self.session.run_batch(&self.profile.test_commands).await?;
        ensure_complete(&output)?;

        let Some(remote) = self.profile.verification_file.clone() else {
            return Ok(());
        };
        let file_name = Utf8Path::new(&remote).file_name().unwrap_or("verification");
        let local = self.artifacts_dir().join(file_name);
        fs::create_dir_all(&self.artifacts_dir())?;
        self.session.copy_from_remote(&remote, &local).await?;
        if !fs::exists(&local)? {
            return Err(StageError::MissingArtifact { path: local });
        }
        info!(path = %local, "verification file fetched");
        Ok(())
    }
}

fn ensure_complete(output: &ShellOutput) -> Result<(), StageError> {
    if output.complete {
        Ok(())
    } else {
        warn!("captured output is partial");
        Err(StageError::Incomplete)
    }
}

/// `dir/` so that `rsync` copies the directory's contents.
fn contents_of(dir: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}/", dir.as_str().trim_end_matches('/')))
}

impl<C: Connector> Pipeline for ShellPipeline<C> {
    fn prepare_patched_source(&mut self) -> StageFuture<'_> {
        Box::pin(self.patch())
    }

    fn push_source(&mut self) -> StageFuture<'_> {
        Box::pin(self.push())
    }

    fn build(&mut self) -> StageFuture<'_> {
        Box::pin(self.build_packages())
    }

    fn fetch_artifacts(&mut self) -> StageFuture<'_> {
        Box::pin(self.fetch())
    }

    fn test(&mut self) -> StageFuture<'_> {
        Box::pin(self.run_tests())
    }

    fn disconnect(&mut self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.session.close())
    }
}
