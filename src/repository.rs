//! Package-repository collaborator.
//!
//! Repository-backed targets hand their sources to a hosted build service
//! instead of a machine of their own. [`OscRepository`] drives an Open Build
//! Service project through the `osc` client: publish the checkout, commit
//! to trigger a rebuild, poll the results and download the binaries.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fs::{self, FsError};
use crate::process::{CommandError, CommandRunner, args, run_checked};

/// Commit message used when publishing new sources.
pub const COMMIT_MESSAGE: &str = "Update to latest version";

/// Minimum number of entries a download directory needs to be kept.
const MIN_DOWNLOAD_ENTRIES: usize = 3;

const IN_PROGRESS: [&str; 5] = ["building", "dispatching", "finished", "scheduled", "signing"];
const FAILED: [&str; 3] = ["failed", "broken", "unresolvable"];

/// Errors raised by package-repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A host command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// A local filesystem operation failed.
    #[error(transparent)]
    Fs(#[from] FsError),
    /// No repository project was configured.
    #[error("no package repository configured; set BUILDFLEET_REPOSITORY_PROJECT")]
    Unconfigured,
}

/// Future returned by [`PackageRepository`] operations.
pub type RepositoryFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Operations the pipelines need from a hosted build service.
pub trait PackageRepository: Send + Sync {
    /// Local checkout of the repository project.
    fn checkout_path(&self) -> &Utf8Path;

    /// Creates the local checkout.
    fn checkout(&self) -> RepositoryFuture<'_, ()>;

    /// Schedules every file of the checkout for publication.
    fn publish_sources(&self) -> RepositoryFuture<'_, ()>;

    /// Commits the checkout, which makes the service rebuild.
    fn trigger_build(&self) -> RepositoryFuture<'_, ()>;

    /// Waits until no build result is still in progress and returns the
    /// final results listing.
    fn poll_until_complete(&self) -> RepositoryFuture<'_, String>;

    /// Downloads the binaries of `package` into one directory per
    /// repository/architecture below `destination`.
    fn download_artifacts<'a>(
        &'a self,
        package: &'a str,
        destination: &'a Utf8Path,
    ) -> RepositoryFuture<'a, Vec<Utf8PathBuf>>;
}

/// One line of an `osc results` listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildResult<'a> {
    /// Repository name.
    pub repository: &'a str,
    /// Architecture.
    pub arch: &'a str,
    /// Build state with decorations removed.
    pub status: &'a str,
}

impl BuildResult<'_> {
    /// Whether the service is still working on this result.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        IN_PROGRESS.contains(&self.status)
    }

    /// Whether this result is a failure.
    #[must_use]
    pub fn failed(&self) -> bool {
        FAILED.contains(&self.status)
    }
}

/// Parses an `osc results` listing.
#[must_use]
pub fn parse_results(text: &str) -> Vec<BuildResult<'_>> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let repository = fields.next()?;
            let arch = fields.next()?;
            let status = fields
                .last()?
                .trim_matches(|c: char| c == '(' || c == ')' || c == '*');
            Some(BuildResult {
                repository,
                arch,
                status,
            })
        })
        .collect()
}

/// Results of a listing that ended in failure.
#[must_use]
pub fn failed_results(text: &str) -> Vec<BuildResult<'_>> {
    parse_results(text)
        .into_iter()
        .filter(BuildResult::failed)
        .collect()
}

/// Open Build Service project driven through `osc`.
pub struct OscRepository {
    project: String,
    checkout: Utf8PathBuf,
    runner: Arc<dyn CommandRunner>,
    settle: Duration,
    poll: Duration,
}

impl std::fmt::Debug for OscRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OscRepository")
            .field("project", &self.project)
            .field("checkout", &self.checkout)
            .field("settle", &self.settle)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl OscRepository {
    /// Creates a client for `project` checked out at `checkout`.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        checkout: impl Into<Utf8PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            project: project.into(),
            checkout: checkout.into(),
            runner,
            settle: Duration::from_secs(120),
            poll: Duration::from_secs(60),
        }
    }

    /// Sets the delay before the first poll and the delay between polls.
    #[must_use]
    pub const fn with_timing(mut self, settle: Duration, poll: Duration) -> Self {
        self.settle = settle;
        self.poll = poll;
        self
    }

    async fn osc_in(&self, dir: &Utf8Path, arguments: &[OsString]) -> Result<String, RepositoryError> {
        let output = run_checked(self.runner.as_ref(), Some(dir), "osc", arguments).await?;
        Ok(output.stdout)
    }

    async fn checkout_inner(&self) -> Result<(), RepositoryError> {
        info!(project = %self.project, path = %self.checkout, "checking out repository");
        run_checked(
            self.runner.as_ref(),
            None,
            "osc",
            &args(["co", &self.project, "-o", self.checkout.as_str()]),
        )
        .await?;
        Ok(())
    }

    async fn publish_inner(&self) -> Result<(), RepositoryError> {
        let mut entries = Vec::new();
        for name in visible(fs::list_dir(&self.checkout)?) {
            let children = fs::list_dir(&self.checkout.join(&name)).unwrap_or_default();
            entries.extend(
                visible(children)
                    .into_iter()
                    .map(|child| format!("{name}/{child}")),
            );
            entries.push(name);
        }
        entries.sort();

        for entry in entries {
            let output = self
                .runner
                .run_in(Some(&self.checkout), "osc", &args(["add", &entry]))
                .await?;
            if !output.is_success() {
                // Already tracked files are reported as failures.
                debug!(entry = %entry, stderr = %output.stderr.trim(), "osc add skipped");
            }
        }
        Ok(())
    }

    async fn trigger_inner(&self) -> Result<(), RepositoryError> {
        info!(project = %self.project, "committing sources");
        self.osc_in(&self.checkout, &args(["ci", "-m", COMMIT_MESSAGE]))
            .await?;
        Ok(())
    }

    async fn poll_inner(&self) -> Result<String, RepositoryError> {
        debug!(delay = ?self.settle, "waiting for the build to start");
        tokio::time::sleep(self.settle).await;
        loop {
            let results = self.osc_in(&self.checkout, &args(["results"])).await?;
            if !parse_results(&results).iter().any(BuildResult::in_progress) {
                return Ok(results);
            }
            debug!(delay = ?self.poll, "still building");
            tokio::time::sleep(self.poll).await;
        }
    }

    async fn download_inner(
        &self,
        package: &str,
        destination: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, RepositoryError> {
        let repos = self.osc_in(&self.checkout, &args(["repos"])).await?;
        let package_dir = self.checkout.join(package);
        let mut kept = Vec::new();

        for line in repos.lines() {
            let mut fields = line.split_whitespace();
            let (Some(repository), Some(arch)) = (fields.next(), fields.next()) else {
                continue;
            };
            let target = destination.join(format!("{repository}_{arch}"));
            info!(repository, arch, dir = %target, "downloading binaries");
            let output = self
                .runner
                .run_in(
                    Some(&package_dir),
                    "osc",
                    &args(["getbinaries", repository, arch, "-d", target.as_str()]),
                )
                .await?;
            if !output.is_success() {
                warn!(repository, arch, stderr = %output.stderr.trim(), "download failed");
            }

            let entries = fs::list_dir(&target).map_or(0, |names| names.len());
            if entries < MIN_DOWNLOAD_ENTRIES {
                fs::remove_dir_all(&target)?;
            } else {
                kept.push(target);
            }
        }
        Ok(kept)
    }
}

fn visible(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| !name.starts_with('.'))
        .collect()
}

impl PackageRepository for OscRepository {
    fn checkout_path(&self) -> &Utf8Path {
        &self.checkout
    }

    fn checkout(&self) -> RepositoryFuture<'_, ()> {
        Box::pin(self.checkout_inner())
    }

    fn publish_sources(&self) -> RepositoryFuture<'_, ()> {
        Box::pin(self.publish_inner())
    }

    fn trigger_build(&self) -> RepositoryFuture<'_, ()> {
        Box::pin(self.trigger_inner())
    }

    fn poll_until_complete(&self) -> RepositoryFuture<'_, String> {
        Box::pin(self.poll_inner())
    }

    fn download_artifacts<'a>(
        &'a self,
        package: &'a str,
        destination: &'a Utf8Path,
    ) -> RepositoryFuture<'a, Vec<Utf8PathBuf>> {
        Box::pin(self.download_inner(package, destination))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;
    use tokio::time::Instant;

    use super::*;
    use crate::test_support::ScriptedRunner;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        (tmp, root)
    }

    fn repository(runner: &ScriptedRunner, checkout: &Utf8Path) -> OscRepository {
        OscRepository::new("home:builder:Project", checkout, Arc::new(runner.clone()))
            .with_timing(Duration::from_secs(120), Duration::from_secs(60))
    }

    #[rstest]
    #[case("openSUSE_Tumbleweed  x86_64  succeeded", "succeeded", false, false)]
    #[case("Debian_12  x86_64  building*", "building", true, false)]
    #[case("Fedora_40  aarch64  (finished)", "finished", true, false)]
    #[case("xUbuntu_24.04  x86_64  Project  unresolvable", "unresolvable", false, true)]
    fn results_lines_are_classified(
        #[case] line: &str,
        #[case] status: &str,
        #[case] in_progress: bool,
        #[case] failed: bool,
    ) {
        let parsed = parse_results(line);
        let result = parsed.first().expect("one result");

        assert_eq!(result.status, status);
        assert_eq!(result.in_progress(), in_progress);
        assert_eq!(result.failed(), failed);
    }

    #[test]
    fn failed_results_ignores_successes() {
        let listing = "Debian_12 x86_64 succeeded\nFedora_40 x86_64 failed\nopenSUSE x86_64 broken\n";

        let failed: Vec<_> = failed_results(listing)
            .into_iter()
            .map(|result| result.repository)
            .collect();

        assert_eq!(failed, vec!["Fedora_40", "openSUSE"]);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_waits_while_results_are_in_progress() {
        let (_tmp, root) = temp_root();
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "Debian_12 x86_64 building\n", "");
        runner.push_output(Some(0), "Debian_12 x86_64 (dispatching)\n", "");
        runner.push_output(Some(0), "Debian_12 x86_64 succeeded\n", "");
        let repo = repository(&runner, &root);
        let started = Instant::now();

        let results = repo.poll_until_complete().await.expect("poll");

        assert_eq!(results, "Debian_12 x86_64 succeeded\n");
        assert_eq!(runner.invocations().len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(240));
    }

    #[tokio::test]
    async fn publish_adds_top_level_and_nested_entries() {
        let (_tmp, root) = temp_root();
        fs::create_dir_all(&root.join("Project-QT5")).expect("mkdir");
        fs::create_dir_all(&root.join(".osc")).expect("mkdir");
        fs::write(&root.join("Project-QT5/Project.spec"), "").expect("write");
        fs::write(&root.join("README"), "").expect("write");
        let runner = ScriptedRunner::succeeding();
        let repo = repository(&runner, &root);

        repo.publish_sources().await.expect("publish");

        assert_eq!(
            runner.commands(),
            vec![
                "osc add Project-QT5",
                "osc add Project-QT5/Project.spec",
                "osc add README",
            ]
        );
    }

    #[tokio::test]
    async fn trigger_build_commits_in_checkout() {
        let (_tmp, root) = temp_root();
        let runner = ScriptedRunner::succeeding();
        let repo = repository(&runner, &root);

        repo.trigger_build().await.expect("commit");

        let invocation = runner.invocations().pop().expect("invocation");
        assert_eq!(
            invocation.command_string(),
            format!("osc ci -m {COMMIT_MESSAGE}")
        );
        assert_eq!(invocation.dir, Some(root));
    }

    #[tokio::test]
    async fn download_drops_sparse_directories() {
        let (_tmp, root) = temp_root();
        let dest = root.join("distr/obs");
        for name in ["a.rpm", "b.rpm", "c.rpm"] {
            fs::create_dir_all(&dest.join("Fedora_40_x86_64")).expect("mkdir");
            fs::write(&dest.join("Fedora_40_x86_64").join(name), "").expect("write");
        }
        fs::create_dir_all(&dest.join("Debian_12_x86_64")).expect("mkdir");
        fs::write(&dest.join("Debian_12_x86_64/_statistics"), "").expect("write");
        let runner = ScriptedRunner::succeeding();
        runner.push_output(Some(0), "Fedora_40 x86_64\nDebian_12 x86_64\n", "");
        let repo = repository(&runner, &root.join("checkout"));

        let kept = repo
            .download_artifacts("Project-QT5", &dest)
            .await
            .expect("download");

        assert_eq!(kept, vec![dest.join("Fedora_40_x86_64")]);
        assert!(!fs::exists(&dest.join("Debian_12_x86_64")).expect("exists"));
        let getbinaries = runner.invocations().pop().expect("invocation");
        assert_eq!(getbinaries.dir, Some(root.join("checkout/Project-QT5")));
    }
}
