//! Process-wide context shared by every build target.
//!
//! The source mirror and the package repository are expensive to create
//! and shared by all targets, so they are initialised lazily on first use
//! and exactly once, even when several target workers ask at the same time.

use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::FleetConfig;
use crate::fs;
use crate::process::CommandRunner;
use crate::repository::{OscRepository, PackageRepository, RepositoryError};
use crate::vcs::{SvnMirror, VcsError, VersionControl};

/// Configuration, command runner and lazily created collaborators.
pub struct FleetContext {
    config: FleetConfig,
    runner: Arc<dyn CommandRunner>,
    vcs: OnceCell<Arc<dyn VersionControl>>,
    repository: OnceCell<Arc<dyn PackageRepository>>,
}

impl std::fmt::Debug for FleetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetContext")
            .field("config", &self.config)
            .field("vcs_ready", &self.vcs.initialized())
            .field("repository_ready", &self.repository.initialized())
            .finish_non_exhaustive()
    }
}

impl FleetContext {
    /// Creates a context whose collaborators are built from `config`.
    #[must_use]
    pub fn new(config: FleetConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            vcs: OnceCell::new(),
            repository: OnceCell::new(),
        }
    }

    /// Uses `vcs` instead of checking out a mirror.
    #[must_use]
    pub fn with_vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = OnceCell::new_with(Some(vcs));
        self
    }

    /// Uses `repository` instead of checking out the configured project.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn PackageRepository>) -> Self {
        self.repository = OnceCell::new_with(Some(repository));
        self
    }

    /// Orchestrator configuration.
    #[must_use]
    pub const fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Runner for commands on the controlling host.
    #[must_use]
    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// The shared source mirror, checked out on first use.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the fresh checkout fails; a later call
    /// tries again.
    pub async fn vcs(&self) -> Result<Arc<dyn VersionControl>, VcsError> {
        self.vcs
            .get_or_try_init(|| self.create_vcs())
            .await
            .map(Arc::clone)
    }

    /// The shared package repository, checked out on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Unconfigured`] without a configured
    /// project and [`RepositoryError`] when the checkout fails.
    pub async fn repository(&self) -> Result<Arc<dyn PackageRepository>, RepositoryError> {
        self.repository
            .get_or_try_init(|| self.create_repository())
            .await
            .map(Arc::clone)
    }

    async fn create_vcs(&self) -> Result<Arc<dyn VersionControl>, VcsError> {
        let path = Utf8PathBuf::from(&self.config.mirror_path);
        fs::remove_dir_all(&path)?;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mirror = SvnMirror::new(&self.config.vcs_url, path, self.runner())
            .with_version_file(self.config.version_file.as_ref().map(Utf8PathBuf::from));
        mirror.checkout().await?;
        let update = mirror.update().await?;
        info!(revision = ?update.revision, "source mirror ready");
        Ok(Arc::new(mirror))
    }

    async fn create_repository(&self) -> Result<Arc<dyn PackageRepository>, RepositoryError> {
        let Some(project) = self.config.repository_project.as_deref() else {
            return Err(RepositoryError::Unconfigured);
        };
        let path = Utf8PathBuf::from(&self.config.repository_checkout);
        fs::remove_dir_all(&path)?;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let repository = OscRepository::new(project, path, self.runner())
            .with_timing(self.config.build_settle(), self.config.build_poll());
        repository.checkout().await?;
        info!(project, "package repository ready");
        Ok(Arc::new(repository))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::ScriptedRunner;

    fn context(runner: &ScriptedRunner, root: &camino::Utf8Path) -> FleetContext {
        let mut config = FleetConfig::with_defaults("svn://example.org/project/trunk/src");
        config.mirror_path = root.join("repos/source").into_string();
        config.repository_checkout = root.join("repos/packaging").into_string();
        FleetContext::new(config, Arc::new(runner.clone()))
    }

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        (tmp, root)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mirror_is_checked_out_once_for_concurrent_callers() {
        let (_tmp, root) = temp_root();
        let runner = ScriptedRunner::succeeding();
        let shared = Arc::new(context(&runner, &root));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let ctx = Arc::clone(&shared);
            handles.push(tokio::spawn(async move { ctx.vcs().await.map(|_| ()) }));
        }
        for handle in handles {
            handle.await.expect("task").expect("vcs");
        }

        let checkouts = runner
            .commands()
            .into_iter()
            .filter(|command| command.starts_with("svn co"))
            .count();
        assert_eq!(checkouts, 1);
    }

    #[tokio::test]
    async fn stale_mirror_is_removed_before_checkout() {
        let (_tmp, root) = temp_root();
        let stale = root.join("repos/source/old.txt");
        fs::create_dir_all(&root.join("repos/source")).expect("mkdir");
        fs::write(&stale, "stale").expect("write");
        let runner = ScriptedRunner::succeeding();

        context(&runner, &root).vcs().await.expect("vcs");

        assert!(!fs::exists(&stale).expect("exists"));
    }

    #[tokio::test]
    async fn failed_checkout_is_retried_on_next_call() {
        let (_tmp, root) = temp_root();
        let runner = ScriptedRunner::succeeding();
        runner.push_failure(1);
        let ctx = context(&runner, &root);

        assert!(ctx.vcs().await.is_err());
        assert!(ctx.vcs().await.is_ok());
    }

    #[tokio::test]
    async fn repository_requires_a_project() {
        let (_tmp, root) = temp_root();
        let ctx = context(&ScriptedRunner::succeeding(), &root);

        assert!(matches!(
            ctx.repository().await,
            Err(RepositoryError::Unconfigured)
        ));
    }
}
