//! Targets built by a hosted package repository.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use super::{Pipeline, StageError, StageFuture};
use crate::context::FleetContext;
use crate::fs;
use crate::process::{args, run_checked};
use crate::repository::failed_results;

/// Placeholder file replaced by the source tarball.
pub const TARBALL_PLACEHOLDER: &str = "__TGZ__";

/// Repository target settings from the machine directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RepositorySettings {
    /// Patch overlay directory, relative to the patches root.
    pub patch_dir: String,
    /// Tarball name prefix; the tarball is `<prefix>-<version>.tar.gz`.
    pub archive_prefix: String,
    /// Package whose binaries are downloaded.
    pub package: String,
}

/// Pipeline of a target that publishes sources to a package repository.
#[derive(Debug)]
pub struct RepositoryPipeline {
    target: String,
    settings: RepositorySettings,
    context: Arc<FleetContext>,
}

impl RepositoryPipeline {
    /// Creates the pipeline of `target`.
    #[must_use]
    pub const fn new(
        target: String,
        settings: RepositorySettings,
        context: Arc<FleetContext>,
    ) -> Self {
        Self {
            target,
            settings,
            context,
        }
    }

    async fn patch(&mut self) -> Result<(), StageError> {
        let config = self.context.config();
        let destination = config.patched_root().join(&self.target);
        fs::remove_dir_all(&destination)?;
        let vcs = self.context.vcs().await?;
        let repository = self.context.repository().await?;

        let patches = config.patches_root().join(&self.settings.patch_dir);
        let snapshot = vcs.snapshot_with_overlay(&destination, &patches).await?;
        let version = vcs.version().await?;
        let name = format!("{}-{version}", self.settings.archive_prefix);
        let tarball = vcs.archive(&snapshot, &name).await?;
        info!(tarball = %tarball, version = %version, "source tarball created");

        let mut values = self.checksums(&tarball).await?;
        values.insert("__VERSION__", version);

        let checkout = repository.checkout_path().to_path_buf();
        remove_stale_tarballs(&checkout)?;
        let template = format!("{checkout}-template/.");
        run_checked(
            self.context.runner().as_ref(),
            None,
            "cp",
            &args(["-R", &template, checkout.as_str()]),
        )
        .await?;
        self.fill_templates(&checkout, &tarball, &values).await?;

        fs::remove_file(&tarball)?;
        Ok(())
    }

    async fn checksums(&self, tarball: &Utf8Path) -> Result<BTreeMap<&'static str, String>, StageError> {
        let runner = self.context.runner();
        let mut values = BTreeMap::new();
        for (placeholder, program) in [
            ("__SHA1__", "sha1sum"),
            ("__SHA256__", "sha256sum"),
            ("__MD5__", "md5sum"),
        ] {
            let output = run_checked(runner.as_ref(), None, program, &args([tarball.as_str()])).await?;
            values.insert(placeholder, first_field(&output.stdout));
        }
        let size = run_checked(
            runner.as_ref(),
            None,
            "stat",
            &args(["-c", "%s", tarball.as_str()]),
        )
        .await?;
        values.insert("__SIZE__", first_field(&size.stdout));
        Ok(values)
    }

    async fn fill_templates(
        &self,
        checkout: &Utf8Path,
        tarball: &Utf8Path,
        values: &BTreeMap<&'static str, String>,
    ) -> Result<(), StageError> {
        let tarball_name = tarball.file_name().unwrap_or_default();
        for relative in tracked_files(checkout)? {
            let path = checkout.join(&relative);
            if relative.file_name() == Some(TARBALL_PLACEHOLDER) {
                let dir = path.parent().unwrap_or(checkout);
                let copy = dir.join(tarball_name);
                run_checked(
                    self.context.runner().as_ref(),
                    None,
                    "cp",
                    &args([tarball.as_str(), copy.as_str()]),
                )
                .await?;
                fs::remove_file(&path)?;
                continue;
            }
            if relative.as_str().ends_with(".tar.gz") {
                continue;
            }
            let Ok(original) = fs::read_to_string(&path) else {
                debug!(path = %path, "skipping non-text file");
                continue;
            };
            let filled = substitute(&original, values);
            if filled != original {
                fs::write(&path, filled)?;
            }
        }
        Ok(())
    }

    async fn publish(&mut self) -> Result<(), StageError> {
        self.context.repository().await?.publish_sources().await?;
        Ok(())
    }

    async fn build_packages(&mut self) -> Result<(), StageError> {
        let repository = self.context.repository().await?;
        repository.trigger_build().await?;
        let results = repository.poll_until_complete().await?;
        info!(results = %results.trim_end(), "repository build finished");

        let failed: Vec<String> = failed_results(&results)
            .iter()
            .map(|result| format!("{} {} {}", result.repository, result.arch, result.status))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StageError::BuildFailed {
                results: failed.join("; "),
            })
        }
    }

    async fn fetch(&mut self) -> Result<(), StageError> {
        let destination = self.context.config().artifacts_root().join(&self.target);
        fs::reset_dir(&destination)?;
        let kept = self
            .context
            .repository()
            .await?
            .download_artifacts(&self.settings.package, &destination)
            .await?;
        info!(directories = kept.len(), path = %destination, "binaries downloaded");
        Ok(())
    }
}

fn first_field(output: &str) -> String {
    output
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_owned()
}

fn substitute(text: &str, values: &BTreeMap<&'static str, String>) -> String {
    values
        .iter()
        .fold(text.to_owned(), |acc, (placeholder, value)| acc.replace(placeholder, value))
}

/// Files of the checkout outside hidden directories.
fn tracked_files(checkout: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StageError> {
    Ok(fs::walk_files(checkout)?
        .into_iter()
        .filter(|path| !path.components().any(|part| part.as_str().starts_with('.')))
        .collect())
}

/// Removes tarballs left in the package directories by a previous run.
fn remove_stale_tarballs(checkout: &Utf8Path) -> Result<(), StageError> {
    for relative in tracked_files(checkout)? {
        if relative.components().count() == 2 && relative.as_str().ends_with(".tar.gz") {
            fs::remove_file(&checkout.join(relative))?;
        }
    }
    Ok(())
}

impl Pipeline for RepositoryPipeline {
    fn prepare_patched_source(&mut self) -> StageFuture<'_> {
        Box::pin(self.patch())
    }

    fn push_source(&mut self) -> StageFuture<'_> {
        Box::pin(self.publish())
    }

    fn build(&mut self) -> StageFuture<'_> {
        Box::pin(self.build_packages())
    }

    fn fetch_artifacts(&mut self) -> StageFuture<'_> {
        Box::pin(self.fetch())
    }

    fn test(&mut self) -> StageFuture<'_> {
        Box::pin(async {
            info!("no test procedure for repository targets");
            Ok(())
        })
    }
}
