//! Remote command procedures of the built-in target kinds.
//!
//! A [`TargetProfile`] is plain data: where the source goes, which shell
//! commands build and test it, and where the results are picked up. The
//! command lists are the toolchain invocations each platform needs and are
//! run exactly as written.

use serde::{Deserialize, Serialize};

/// Markers that reveal a failed build in otherwise captured output.
pub const DEFAULT_FAILURE_MARKERS: [&str; 2] = ["make: ***", "configure: error:"];

const PRINT_MANUAL: &str = r#"(begin (load-help-book "main/man-user-manual") (wrapped-print-to-file"#;

/// Per-target remote procedure.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TargetProfile {
    /// Patch overlay directory, relative to the patches root.
    pub patch_dir: String,
    /// Remote directory receiving the patched source tree.
    pub remote_source_dir: String,
    /// Commands run before the source is copied (usually clearing the old
    /// copy).
    #[serde(default)]
    pub prepare_commands: Vec<String>,
    /// Commands producing the packages.
    pub build_commands: Vec<String>,
    /// Remote directory whose contents are the build artifacts.
    pub remote_artifacts_dir: String,
    /// Commands installing and exercising the packages.
    #[serde(default)]
    pub test_commands: Vec<String>,
    /// Remote file produced by the test commands.
    #[serde(default)]
    pub verification_file: Option<String>,
    /// Interpreter launched right after connecting.
    #[serde(default)]
    pub default_shell: Option<String>,
    /// `rsync` executable on the remote side.
    #[serde(default)]
    pub remote_rsync: Option<String>,
    /// Output fragments that fail the build stage.
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,
}

fn default_failure_markers() -> Vec<String> {
    DEFAULT_FAILURE_MARKERS.map(str::to_owned).to_vec()
}

fn owned<const N: usize>(commands: [&str; N]) -> Vec<String> {
    commands.map(str::to_owned).to_vec()
}

impl TargetProfile {
    /// Generic Linux build producing a relocatable tarball.
    #[must_use]
    pub fn linux(user: &str) -> Self {
        let home = format!("/home/{user}");
        Self {
            patch_dir: String::from("patchubu16static"),
            remote_source_dir: format!("{home}/DEV/texmacs"),
            prepare_commands: vec![format!("rm -rf {home}/DEV/texmacs")],
            build_commands: vec![
                String::from("cd DEV"),
                String::from("rm -rf distr/*"),
                String::from("cd texmacs"),
                format!("./configure --with-tmrepo={home}/DEV/SDK"),
                String::from("make"),
                String::from("make PACKAGE"),
            ],
            remote_artifacts_dir: format!("{home}/DEV/distr"),
            test_commands: vec![
                String::from("rm -rf ~/.TeXmacs/"),
                String::from("cd DEV"),
                String::from("rm -rf test"),
                String::from("mkdir test"),
                String::from("cd distr/generic"),
                String::from("tar -xzf TeXmacs-*.tar.gz"),
                String::from("cd TeXmacs-*"),
                String::from("cd TeXmacs"),
                String::from("export TEXMACS_PATH=`pwd`"),
                format!(
                    "./bin/texmacs.bin --headless -x '{PRINT_MANUAL} \"{home}/DEV/test/test.pdf\"))' -q"
                ),
            ],
            verification_file: Some(format!("{home}/DEV/test/test.pdf")),
            default_shell: None,
            remote_rsync: None,
            failure_markers: default_failure_markers(),
        }
    }

    /// macOS build producing a disk image. `sdk` overrides the default
    /// `~/DEV/SDK` dependency tree.
    #[must_use]
    pub fn macos(user: &str, sdk: Option<&str>) -> Self {
        let home = format!("/Users/{user}");
        let tmrepo = sdk.map_or_else(|| format!("{home}/DEV/SDK"), str::to_owned);
        Self {
            patch_dir: String::from("patchmac"),
            remote_source_dir: format!("{home}/DEV/texmacs"),
            prepare_commands: vec![format!("rm -rf {home}/DEV/texmacs")],
            build_commands: vec![
                String::from("rm -rf ~/.TeXmacs/"),
                String::from("source TMenvOPT"),
                String::from("cd DEV"),
                String::from("rm -rf distr/*"),
                String::from("cd texmacs"),
                String::from("make distclean"),
                format!(
                    "PKG_CONFIG_PATH={home}/DEV/SDK/lib/pkgconfig ./configure --with-tmrepo={tmrepo}"
                ),
                String::from("make"),
                String::from("make PACKAGE"),
            ],
            remote_artifacts_dir: format!("{home}/DEV/distr"),
            test_commands: vec![
                String::from("cd DEV"),
                String::from("rm -rf test"),
                String::from("mkdir test"),
                String::from("cp distr/macos/*.dmg test/texmacs.dmg"),
                String::from("cd test"),
                String::from("export TEXMACS_VOLUME=/Volumes/TeXmacs"),
                String::from("hdiutil attach texmacs.dmg"),
                format!(
                    "$TEXMACS_VOLUME/TeXmacs.app/Contents/MacOS/TeXmacs --headless -x '{PRINT_MANUAL} \"$PWD/test.pdf\"))' -q"
                ),
                String::from("hdiutil detach $TEXMACS_VOLUME"),
            ],
            verification_file: Some(format!("{home}/DEV/test/test.pdf")),
            default_shell: None,
            remote_rsync: None,
            failure_markers: default_failure_markers(),
        }
    }

    /// Windows build inside an MSYS2 MinGW shell.
    #[must_use]
    pub fn windows(user: &str) -> Self {
        let home = format!("/c/msys64/niv2/home/{user}");
        Self {
            patch_dir: String::from("patchwin"),
            remote_source_dir: format!("{home}/texmacs"),
            prepare_commands: vec![format!("cd {home}"), String::from("rm -rf texmacs")],
            build_commands: vec![
                format!("cd {home}"),
                String::from(r#"export PATH="/c/Program Files (x86)/GnuWin32/bin":$PATH"#),
                String::from("export with_sparkle=/WinSparkle-0.6.0"),
                String::from("rm -rf distr"),
                String::from("cd texmacs"),
                String::from("./configure --with-tmrepo=/SDK --with-qt=/Qt"),
                String::from("make"),
                String::from("make PACKAGE"),
            ],
            remote_artifacts_dir: format!("{home}/distr"),
            test_commands: vec![
                format!("cd {home}"),
                String::from("rm -rf test"),
                String::from("mkdir test"),
                String::from("cd distr/TeXmacs-Windows"),
                String::from("export TEXMACS_PATH=`pwd -W`"),
                String::from("export PATH=/SDK/bin:/WinSparkle-0.6.0/Release:$PWD/bin:$PATH"),
                format!(
                    "./bin/texmacs.exe --headless -x '{PRINT_MANUAL} \"C:/msys64/niv2/home/{user}/test/test.pdf\"))' -q"
                ),
            ],
            verification_file: Some(format!("/niv2/home/{user}/test/test.pdf")),
            default_shell: Some(String::from(
                r"C:\msys64\niv2\msys2_shell.cmd -mingw32 -defterm -no-start -here",
            )),
            remote_rsync: Some(String::from(r"C:\msys64\usr\bin\rsync.exe")),
            failure_markers: default_failure_markers(),
        }
    }

    /// Android build through the cross-compilation builder checkout.
    /// There is no test procedure.
    #[must_use]
    pub fn android(user: &str) -> Self {
        let home = format!("/home/{user}");
        Self {
            patch_dir: String::from("patchandroid"),
            remote_source_dir: format!("{home}/DEV/texmacs/src"),
            prepare_commands: vec![format!("rm -rf {home}/DEV/texmacs/src")],
            build_commands: owned(["cd texmacs-builder", "source set-devel-path", "make texmacs"]),
            remote_artifacts_dir: format!("{home}/texmacs-builder/texmacs/distr"),
            test_commands: Vec::new(),
            verification_file: None,
            default_shell: None,
            remote_rsync: None,
            failure_markers: default_failure_markers(),
        }
    }

    /// First failure marker present in `output`.
    #[must_use]
    pub fn failure_in(&self, output: &str) -> Option<&str> {
        self.failure_markers
            .iter()
            .map(String::as_str)
            .find(|marker| !marker.is_empty() && output.contains(marker))
    }
}
