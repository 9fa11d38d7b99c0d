//! Configuration loading via `ortho-config`.
//!
//! Two layered configuration structs exist: [`FleetConfig`] covers working
//! directories, collaborator locations and lease timing, while [`SshConfig`]
//! covers how the controlling host reaches remote machines. Both merge
//! defaults, configuration files and environment variables.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default location of the machine directory document.
pub const DEFAULT_FLEET_FILE: &str = "fleet.json";

/// Orchestrator settings derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BUILDFLEET",
    discovery(
        app_name = "buildfleet",
        env_var = "BUILDFLEET_CONFIG_PATH",
        config_file_name = "buildfleet.toml",
        dotfile_name = ".buildfleet.toml",
        project_file_name = "buildfleet.toml"
    )
)]
pub struct FleetConfig {
    /// Path to the JSON machine directory.
    #[ortho_config(default = DEFAULT_FLEET_FILE.to_owned())]
    pub fleet_file: String,
    /// Root directory receiving one artifact directory per target.
    #[ortho_config(default = "distr".to_owned())]
    pub artifacts_root: String,
    /// Directory receiving one log file per target.
    #[ortho_config(default = "logs".to_owned())]
    pub logs_dir: String,
    /// Directory receiving one patched source tree per target.
    #[ortho_config(default = "patched".to_owned())]
    pub patched_root: String,
    /// Directory holding one patch overlay directory per target variant.
    #[ortho_config(default = "patchs".to_owned())]
    pub patches_root: String,
    /// Local path of the upstream source mirror.
    #[ortho_config(default = "repos/source".to_owned())]
    pub mirror_path: String,
    /// Upstream repository URL mirrored at `mirror_path`.
    pub vcs_url: String,
    /// Changelog file (relative to the mirror) scanned for the source version.
    pub version_file: Option<String>,
    /// Package repository project name (for example `home:user:Project`).
    pub repository_project: Option<String>,
    /// Local checkout of the package repository project.
    #[ortho_config(default = "repos/packaging".to_owned())]
    pub repository_checkout: String,
    /// Package whose binaries are downloaded after a repository build.
    pub repository_package: Option<String>,
    /// Seconds between reachability probes while a lease powers a machine.
    #[ortho_config(default = 10)]
    pub reachability_poll_secs: u64,
    /// Upper bound for reachability polling; `0` waits indefinitely.
    #[ortho_config(default = 0)]
    pub reachability_timeout_secs: u64,
    /// Seconds to wait after triggering a repository build before polling.
    #[ortho_config(default = 120)]
    pub build_settle_secs: u64,
    /// Seconds between repository build status polls.
    #[ortho_config(default = 60)]
    pub build_poll_secs: u64,
}

/// Remote access settings used for interactive sessions and transfers.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "BUILDFLEET_SSH")]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the local `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for lab machines
    /// whose keys change when they are reinstalled.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Path to the SSH private key used for remote authentication.
    pub ssh_identity_file: Option<String>,
    /// Idle seconds that end the startup banner drain.
    #[ortho_config(default = 10)]
    pub banner_idle_secs: u64,
    /// Idle seconds that end a command wait; `0` waits indefinitely.
    #[ortho_config(default = 0)]
    pub command_idle_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to buildfleet.toml",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

/// Converts a seconds setting where zero means "no bound".
const fn optional_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

impl FleetConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("buildfleet")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when the poll interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.fleet_file,
                FieldMetadata::new("machine directory", "BUILDFLEET_FLEET_FILE", "fleet_file"),
            ),
            (
                &self.artifacts_root,
                FieldMetadata::new(
                    "artifacts root",
                    "BUILDFLEET_ARTIFACTS_ROOT",
                    "artifacts_root",
                ),
            ),
            (
                &self.logs_dir,
                FieldMetadata::new("log directory", "BUILDFLEET_LOGS_DIR", "logs_dir"),
            ),
            (
                &self.patched_root,
                FieldMetadata::new("patched tree root", "BUILDFLEET_PATCHED_ROOT", "patched_root"),
            ),
            (
                &self.patches_root,
                FieldMetadata::new("patch overlay root", "BUILDFLEET_PATCHES_ROOT", "patches_root"),
            ),
            (
                &self.mirror_path,
                FieldMetadata::new("source mirror path", "BUILDFLEET_MIRROR_PATH", "mirror_path"),
            ),
            (
                &self.vcs_url,
                FieldMetadata::new("upstream repository URL", "BUILDFLEET_VCS_URL", "vcs_url"),
            ),
        ];
        for (value, metadata) in &required {
            require_field(value, metadata)?;
        }

        if self.reachability_poll_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "reachability_poll_secs must be at least 1",
            )));
        }
        Ok(())
    }

    /// Interval between reachability probes.
    #[must_use]
    pub const fn reachability_poll_interval(&self) -> Duration {
        Duration::from_secs(self.reachability_poll_secs)
    }

    /// Optional bound on reachability polling.
    #[must_use]
    pub const fn reachability_timeout(&self) -> Option<Duration> {
        optional_secs(self.reachability_timeout_secs)
    }

    /// Root directory for per-target artifacts.
    #[must_use]
    pub fn artifacts_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.artifacts_root)
    }

    /// Directory holding per-target log files.
    #[must_use]
    pub fn logs_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.logs_dir)
    }

    /// Root directory for per-target patched source trees.
    #[must_use]
    pub fn patched_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.patched_root)
    }

    /// Root directory of patch overlays.
    #[must_use]
    pub fn patches_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.patches_root)
    }

    /// Delay between triggering a repository build and the first poll.
    #[must_use]
    pub const fn build_settle(&self) -> Duration {
        Duration::from_secs(self.build_settle_secs)
    }

    /// Delay between repository build polls.
    #[must_use]
    pub const fn build_poll(&self) -> Duration {
        Duration::from_secs(self.build_poll_secs)
    }

    /// Returns the built-in defaults for mirroring `vcs_url`, without
    /// consulting any configuration source.
    #[must_use]
    pub fn with_defaults(vcs_url: impl Into<String>) -> Self {
        Self {
            fleet_file: DEFAULT_FLEET_FILE.to_owned(),
            artifacts_root: String::from("distr"),
            logs_dir: String::from("logs"),
            patched_root: String::from("patched"),
            patches_root: String::from("patchs"),
            mirror_path: String::from("repos/source"),
            vcs_url: vcs_url.into(),
            version_file: None,
            repository_project: None,
            repository_checkout: String::from("repos/packaging"),
            repository_package: None,
            reachability_poll_secs: 10,
            reachability_timeout_secs: 0,
            build_settle_secs: 120,
            build_poll_secs: 60,
        }
    }
}

impl SshConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("buildfleet")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when any required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh executable", "BUILDFLEET_SSH_SSH_BIN", "ssh_bin"),
        )?;
        require_field(
            &self.rsync_bin,
            &FieldMetadata::new("rsync executable", "BUILDFLEET_SSH_RSYNC_BIN", "rsync_bin"),
        )?;
        if let Some(identity) = self.ssh_identity_file.as_deref() {
            require_field(
                identity,
                &FieldMetadata::new(
                    "SSH identity file",
                    "BUILDFLEET_SSH_SSH_IDENTITY_FILE",
                    "ssh_identity_file",
                ),
            )?;
        }
        Ok(())
    }

    /// Idle timeout ending the startup banner drain.
    #[must_use]
    pub const fn banner_idle(&self) -> Duration {
        Duration::from_secs(self.banner_idle_secs)
    }

    /// Optional idle timeout ending a command wait.
    #[must_use]
    pub const fn command_idle(&self) -> Option<Duration> {
        optional_secs(self.command_idle_secs)
    }
}

impl SshConfig {
    /// Returns the built-in defaults without consulting any configuration
    /// source.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            rsync_bin: String::from("rsync"),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            ssh_identity_file: None,
            banner_idle_secs: 10,
            command_idle_secs: 0,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn fleet_config() -> FleetConfig {
        FleetConfig::with_defaults("svn://example.org/project/trunk/src")
    }

    #[rstest]
    fn fleet_config_accepts_defaults(fleet_config: FleetConfig) {
        assert!(fleet_config.validate().is_ok());
        assert_eq!(fleet_config.reachability_timeout(), None);
        assert_eq!(
            fleet_config.reachability_poll_interval(),
            Duration::from_secs(10)
        );
    }

    #[rstest]
    fn fleet_config_rejects_blank_vcs_url(mut fleet_config: FleetConfig) {
        fleet_config.vcs_url = String::from("  ");

        let err = fleet_config
            .validate()
            .expect_err("blank vcs_url should be rejected");
        let ConfigError::MissingField(message) = err else {
            panic!("expected MissingField, got {err:?}");
        };
        assert!(message.contains("BUILDFLEET_VCS_URL"), "message: {message}");
    }

    #[rstest]
    fn fleet_config_rejects_zero_poll_interval(mut fleet_config: FleetConfig) {
        fleet_config.reachability_poll_secs = 0;

        assert!(matches!(
            fleet_config.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[rstest]
    fn fleet_config_bounds_reachability_when_configured(mut fleet_config: FleetConfig) {
        fleet_config.reachability_timeout_secs = 300;

        assert_eq!(
            fleet_config.reachability_timeout(),
            Some(Duration::from_secs(300))
        );
    }

    #[rstest]
    #[case("", "ssh_bin")]
    #[case(" ", "ssh_bin")]
    fn ssh_config_rejects_blank_binaries(#[case] value: &str, #[case] key: &str) {
        let config = SshConfig {
            ssh_bin: value.to_owned(),
            ..SshConfig::with_defaults()
        };

        let err = config.validate().expect_err("blank ssh_bin should fail");
        assert!(err.to_string().contains(key), "error: {err}");
    }

    #[test]
    fn ssh_config_rejects_blank_identity_file() {
        let config = SshConfig {
            ssh_identity_file: Some(String::from("   ")),
            ..SshConfig::with_defaults()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn ssh_config_treats_zero_command_idle_as_unbounded() {
        let config = SshConfig::with_defaults();

        assert_eq!(config.command_idle(), None);
        assert_eq!(config.banner_idle(), Duration::from_secs(10));
    }
}
