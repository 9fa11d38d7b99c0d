//! Version-control collaborator.
//!
//! The fleet only needs a narrow slice of a version-control system: keep a
//! local mirror current, stamp out per-target copies with a patch overlay
//! and package a copy as a tarball. [`SvnMirror`] implements that slice on
//! top of the `svn`, `cp` and `tar` executables.

use std::cmp::Ordering;
use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::fs::{self, FsError};
use crate::process::{CommandError, CommandRunner, args, run_checked};

/// Version reported when the changelog names no release.
pub const FALLBACK_VERSION: &str = "0.0.0";

/// Errors raised by version-control operations.
#[derive(Debug, Error)]
pub enum VcsError {
    /// A host command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// A local filesystem operation failed.
    #[error(transparent)]
    Fs(#[from] FsError),
    /// The snapshot has no usable directory name.
    #[error("snapshot {path} has no directory name")]
    InvalidSnapshot {
        /// Offending snapshot path.
        path: Utf8PathBuf,
    },
}

/// Future returned by [`VersionControl`] operations.
pub type VcsFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, VcsError>> + Send + 'a>>;

/// Outcome of refreshing the mirror.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Update {
    /// Whether the mirror moved to a different revision than last seen.
    pub changed: bool,
    /// Revision reported by the update, when it could be parsed.
    pub revision: Option<String>,
}

/// A patched copy of the mirror.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    path: Utf8PathBuf,
}

impl Snapshot {
    /// Wraps an existing snapshot directory.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Directory holding the snapshot.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Operations the pipelines need from version control.
pub trait VersionControl: Send + Sync {
    /// Creates the mirror from the upstream repository.
    fn checkout(&self) -> VcsFuture<'_, ()>;

    /// Brings the mirror up to date.
    fn update(&self) -> VcsFuture<'_, Update>;

    /// Copies the mirror to `destination` and overlays the files found in
    /// `patches` on top of it.
    fn snapshot_with_overlay<'a>(
        &'a self,
        destination: &'a Utf8Path,
        patches: &'a Utf8Path,
    ) -> VcsFuture<'a, Snapshot>;

    /// Packs `snapshot` into `<parent>/<name>.tar.gz` whose single
    /// top-level folder is `name`.
    fn archive<'a>(&'a self, snapshot: &'a Snapshot, name: &'a str) -> VcsFuture<'a, Utf8PathBuf>;

    /// Highest release version named in the mirror's changelog.
    fn version(&self) -> VcsFuture<'_, String>;
}

/// Subversion working copy used as the source mirror.
pub struct SvnMirror {
    url: String,
    path: Utf8PathBuf,
    version_file: Option<Utf8PathBuf>,
    runner: Arc<dyn CommandRunner>,
    revision: Mutex<Option<String>>,
}

impl std::fmt::Debug for SvnMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvnMirror")
            .field("url", &self.url)
            .field("path", &self.path)
            .field("version_file", &self.version_file)
            .finish_non_exhaustive()
    }
}

impl SvnMirror {
    /// Creates a mirror of `url` at `path`.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        path: impl Into<Utf8PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            version_file: None,
            runner,
            revision: Mutex::new(None),
        }
    }

    /// Reads the release version from `file`, relative to the mirror root.
    #[must_use]
    pub fn with_version_file(mut self, file: Option<Utf8PathBuf>) -> Self {
        self.version_file = file;
        self
    }

    /// Mirror location.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn checkout_inner(&self) -> Result<(), VcsError> {
        let _busy = self.revision.lock().await;
        info!(url = %self.url, path = %self.path, "checking out mirror");
        run_checked(
            self.runner.as_ref(),
            None,
            "svn",
            &args(["co", &self.url, self.path.as_str()]),
        )
        .await?;
        Ok(())
    }

    async fn update_inner(&self) -> Result<Update, VcsError> {
        let mut known = self.revision.lock().await;
        let output = run_checked(self.runner.as_ref(), Some(&self.path), "svn", &args(["up"])).await?;
        let Some(revision) = parse_revision(&output.stdout) else {
            return Ok(Update::default());
        };

        let changed = known.as_deref().is_some_and(|previous| previous != revision);
        if known.as_deref() != Some(revision.as_str()) {
            info!(previous = ?*known, current = %revision, "mirror revision");
        }
        *known = Some(revision.clone());
        Ok(Update {
            changed,
            revision: Some(revision),
        })
    }

    async fn snapshot_inner(
        &self,
        destination: &Utf8Path,
        patches: &Utf8Path,
    ) -> Result<Snapshot, VcsError> {
        let _busy = self.revision.lock().await;
        if let Some(parent) = destination.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        run_checked(
            self.runner.as_ref(),
            None,
            "cp",
            &args(["-R", self.path.as_str(), destination.as_str()]),
        )
        .await?;

        if fs::exists(patches)? {
            let overlay = format!("{patches}/.");
            run_checked(
                self.runner.as_ref(),
                None,
                "cp",
                &args(["-R", &overlay, destination.as_str()]),
            )
            .await?;
        } else {
            warn!(patches = %patches, "patch directory missing; snapshot is unpatched");
        }
        Ok(Snapshot::new(destination))
    }

    async fn archive_inner(&self, snapshot: &Snapshot, name: &str) -> Result<Utf8PathBuf, VcsError> {
        let dir_name = snapshot
            .path()
            .file_name()
            .ok_or_else(|| VcsError::InvalidSnapshot {
                path: snapshot.path().to_path_buf(),
            })?;
        let parent = snapshot
            .path()
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = format!("{name}.tar.gz");
        let rename = format!("s,^{dir_name},{name},");

        let tar_args: Vec<OsString> = args(["-czf", &file_name, "--transform", &rename, dir_name]);
        run_checked(self.runner.as_ref(), Some(parent), "tar", &tar_args).await?;
        Ok(parent.join(file_name))
    }

    fn version_inner(&self) -> Result<String, VcsError> {
        let Some(file) = self.version_file.as_ref() else {
            return Ok(FALLBACK_VERSION.to_owned());
        };
        let changelog = fs::read_to_string(&self.path.join(file))?;
        Ok(highest_version(&changelog))
    }
}

impl VersionControl for SvnMirror {
    fn checkout(&self) -> VcsFuture<'_, ()> {
        Box::pin(self.checkout_inner())
    }

    fn update(&self) -> VcsFuture<'_, Update> {
        Box::pin(self.update_inner())
    }

    fn snapshot_with_overlay<'a>(
        &'a self,
        destination: &'a Utf8Path,
        patches: &'a Utf8Path,
    ) -> VcsFuture<'a, Snapshot> {
        Box::pin(self.snapshot_inner(destination, patches))
    }

    fn archive<'a>(&'a self, snapshot: &'a Snapshot, name: &'a str) -> VcsFuture<'a, Utf8PathBuf> {
        Box::pin(self.archive_inner(snapshot, name))
    }

    fn version(&self) -> VcsFuture<'_, String> {
        let result = self.version_inner();
        Box::pin(async move { result })
    }
}

/// Extracts the revision from `svn up` output.
#[must_use]
pub fn parse_revision(output: &str) -> Option<String> {
    ["At revision ", "Updated to revision "]
        .iter()
        .find_map(|prefix| {
            output
                .lines()
                .find_map(|line| line.trim().strip_prefix(prefix))
        })
        .map(|rest| rest.trim_end_matches('.').trim().to_owned())
        .filter(|revision| !revision.is_empty())
}

/// Highest `(x.y)` or `(x.y.z)` version mentioned in `text`.
#[must_use]
pub fn highest_version(text: &str) -> String {
    let mut best: Option<(Vec<u64>, &str)> = None;
    for candidate in text.split('(').skip(1).filter_map(|rest| rest.split_once(')')) {
        let Some(parts) = parse_release(candidate.0) else {
            continue;
        };
        let better = best
            .as_ref()
            .is_none_or(|(current, _)| compare_versions(&parts, current) == Ordering::Greater);
        if better {
            best = Some((parts, candidate.0));
        }
    }
    best.map_or_else(|| FALLBACK_VERSION.to_owned(), |(_, label)| label.to_owned())
}

fn parse_release(text: &str) -> Option<Vec<u64>> {
    let parts = text
        .split('.')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
                None
            } else {
                part.parse::<u64>().ok()
            }
        })
        .collect::<Option<Vec<_>>>()?;
    matches!(parts.len(), 2 | 3).then_some(parts)
}

fn compare_versions(left: &[u64], right: &[u64]) -> Ordering {
    let width = left.len().max(right.len());
    let padded = |parts: &[u64]| {
        let mut out = parts.to_vec();
        out.resize(width, 0);
        out
    };
    padded(left).cmp(&padded(right))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::ScriptedRunner;

    fn mirror(runner: &ScriptedRunner) -> SvnMirror {
        SvnMirror::new(
            "svn://example.org/project/trunk/src",
            "repos/source",
            Arc::new(runner.clone()),
        )
    }

    #[rstest]
    #[case("Updating '.':\nAt revision 14211.\n", Some("14211"))]
    #[case("Updating '.':\nU    src/main.cpp\nUpdated to revision 14212.\n", Some("14212"))]
    #[case("svn: E170013: Unable to connect\n", None)]
    fn revision_is_parsed_from_update_output(
        #[case] output: &str,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(parse_revision(output).as_deref(), expected);
    }

    #[rstest]
    #[case("<item|(2.1.2)> fixes <item|(2.1)> and (2.1.4)", "2.1.4")]
    #[case("(1.99.20) then (2.1)", "2.1")]
    #[case("(10.0) beats (9.9.9)", "10.0")]
    #[case("(v2) (2) (2.x) (1.2.3.4)", "0.0.0")]
    #[case("no releases here", "0.0.0")]
    fn highest_version_picks_largest_release(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(highest_version(text), expected);
    }

    #[tokio::test]
    async fn update_reports_change_only_after_known_revision() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "At revision 10.\n", "");
        runner.push_output(Some(0), "At revision 10.\n", "");
        runner.push_output(Some(0), "Updated to revision 12.\n", "");
        let svn = mirror(&runner);

        let first = svn.update().await.expect("first update");
        let second = svn.update().await.expect("second update");
        let third = svn.update().await.expect("third update");

        assert!(!first.changed, "no previous revision to compare with");
        assert!(!second.changed);
        assert!(third.changed);
        assert_eq!(third.revision.as_deref(), Some("12"));
        let invocation = runner.invocations().pop().expect("invocation");
        assert_eq!(invocation.dir, Some(Utf8PathBuf::from("repos/source")));
    }

    #[tokio::test]
    async fn snapshot_copies_mirror_then_overlay() {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        let patches = root.join("patchs/linux");
        fs::create_dir_all(&patches).expect("patch dir");
        let runner = ScriptedRunner::succeeding();
        let svn = mirror(&runner);
        let destination = root.join("patched/linux");

        let snapshot = svn
            .snapshot_with_overlay(&destination, &patches)
            .await
            .expect("snapshot");

        assert_eq!(snapshot.path(), destination);
        assert_eq!(
            runner.commands(),
            vec![
                format!("cp -R repos/source {destination}"),
                format!("cp -R {patches}/. {destination}"),
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_without_patch_directory_skips_overlay() {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        let runner = ScriptedRunner::succeeding();
        let svn = mirror(&runner);

        svn.snapshot_with_overlay(&root.join("patched/obs"), &root.join("patchs/none"))
            .await
            .expect("snapshot");

        assert_eq!(runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn archive_renames_top_level_folder() {
        let runner = ScriptedRunner::succeeding();
        let svn = mirror(&runner);

        let path = svn
            .archive(&Snapshot::new("patched/obs"), "Project-2.1.4")
            .await
            .expect("archive");

        assert_eq!(path, Utf8PathBuf::from("patched/Project-2.1.4.tar.gz"));
        let invocation = runner.invocations().pop().expect("invocation");
        assert_eq!(
            invocation.command_string(),
            "tar -czf Project-2.1.4.tar.gz --transform s,^obs,Project-2.1.4, obs"
        );
        assert_eq!(invocation.dir, Some(Utf8PathBuf::from("patched")));
    }

    #[tokio::test]
    async fn failed_checkout_surfaces_command_error() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "svn: E170013: Unable to connect");
        let svn = mirror(&runner);

        let err = svn.checkout().await.expect_err("checkout fails");

        assert!(matches!(err, VcsError::Command(CommandError::Failed { .. })));
    }

    #[tokio::test]
    async fn version_reads_changelog_inside_mirror() {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        fs::create_dir_all(&root.join("doc")).expect("mkdir");
        fs::write(&root.join("doc/changes.tm"), "<section|(2.1.3)><section|(2.1.4)>")
            .expect("write");
        let svn = SvnMirror::new("svn://x", root, Arc::new(ScriptedRunner::new()))
            .with_version_file(Some(Utf8PathBuf::from("doc/changes.tm")));

        assert_eq!(svn.version().await.expect("version"), "2.1.4");
    }
}
