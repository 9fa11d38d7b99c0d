//! The machine directory: which machines exist, how they are powered and
//! probed, and which build targets run on them.
//!
//! The directory is a JSON document loaded once at start:
//!
//! ```json
//! {
//!   "machines": {
//!     "proxmox-guests": {
//!       "power": { "type": "proxmox", "host": "192.168.1.10", "user": "root" },
//!       "probe": { "type": "tcp", "port": 22 }
//!     }
//!   },
//!   "targets": [
//!     { "name": "linux", "address": "192.168.1.105", "user": "magix",
//!       "machine": "proxmox-guests", "kind": { "type": "linux" } }
//!   ]
//! }
//! ```
//!
//! A target without a `machine` gets an always-on machine of its own.

use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;

use crate::fs::{self, FsError};
use crate::pipeline::{RepositorySettings, TargetProfile};

/// Default SSH port of build machines.
pub const DEFAULT_SSH_PORT: u16 = 22;

const fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Errors raised while loading or validating the directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory file could not be read.
    #[error(transparent)]
    Read(#[from] FsError),
    /// The document is not a valid directory.
    #[error("failed to parse machine directory {origin}: {message}")]
    Parse {
        /// File (or other source) being parsed.
        origin: String,
        /// Parser message.
        message: String,
    },
    /// A target names a machine the directory does not define.
    #[error("target {target} refers to unknown machine {machine}")]
    UnknownMachine {
        /// Target name.
        target: String,
        /// Missing machine name.
        machine: String,
    },
    /// Two targets share a name.
    #[error("target {name} is defined more than once")]
    DuplicateTarget {
        /// Repeated name.
        name: String,
    },
    /// A remote target lacks connection details.
    #[error("target {target} needs a non-empty {field}")]
    MissingField {
        /// Target name.
        target: String,
        /// Missing field.
        field: &'static str,
    },
}

/// Machines and targets of one fleet.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MachineDirectory {
    /// Shared machines by name.
    #[serde(default)]
    pub machines: BTreeMap<String, MachineProfile>,
    /// Build targets, in scheduling order.
    pub targets: Vec<TargetSpec>,
}

/// Lifecycle policy of one machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MachineProfile {
    /// How the machine is powered on and off.
    #[serde(default)]
    pub power: PowerSpec,
    /// How readiness is detected.
    #[serde(default)]
    pub probe: ProbeSpec,
}

/// Power management of a machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PowerSpec {
    /// Always on; leases only serialise access.
    #[default]
    None,
    /// Guests of a Proxmox hypervisor.
    Proxmox {
        /// Hypervisor host.
        host: String,
        /// Login on the hypervisor.
        user: String,
    },
}

/// Reachability probe of a machine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeSpec {
    /// TCP connect to a port.
    Tcp {
        /// Port to connect to.
        #[serde(default = "default_ssh_port")]
        port: u16,
    },
    /// ICMP echo.
    Ping,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self::Tcp {
            port: DEFAULT_SSH_PORT,
        }
    }
}

/// One build target.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    /// Unique target name; names the log file and artifact directory.
    pub name: String,
    /// Address of the build machine.
    #[serde(default)]
    pub address: String,
    /// Login on the build machine.
    #[serde(default)]
    pub user: String,
    /// SSH port of the build machine.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Shared machine hosting the target.
    #[serde(default)]
    pub machine: Option<String>,
    /// What the target builds and how.
    pub kind: TargetKind,
}

impl TargetSpec {
    /// Name of the machine leased by this target.
    #[must_use]
    pub fn machine_name(&self) -> &str {
        self.machine.as_deref().unwrap_or(&self.name)
    }
}

/// Kind of build target.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetKind {
    /// Linux tarball build.
    Linux,
    /// macOS disk image build.
    Macos {
        /// Alternative dependency tree.
        #[serde(default)]
        sdk: Option<String>,
    },
    /// Windows build in MSYS2.
    Windows,
    /// Android cross build.
    Android,
    /// Remote build described in full by the directory.
    Custom {
        /// Remote procedure.
        profile: TargetProfile,
    },
    /// Sources published to a package repository.
    Repository {
        /// Patch overlay directory.
        patch_dir: String,
        /// Tarball name prefix.
        archive_prefix: String,
        /// Package to download; defaults to the configured package.
        #[serde(default)]
        package: Option<String>,
    },
}

/// How a target is driven, resolved from its [`TargetKind`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TargetPlan {
    /// Remote build over an interactive session.
    Shell(TargetProfile),
    /// Build by a package repository.
    Repository(RepositorySettings),
}

impl TargetKind {
    /// Resolves the kind for `user`; `fallback_package` applies to
    /// repository targets whose entry names no package.
    #[must_use]
    pub fn plan(&self, user: &str, fallback_package: &str) -> TargetPlan {
        match self {
            Self::Linux => TargetPlan::Shell(TargetProfile::linux(user)),
            Self::Macos { sdk } => TargetPlan::Shell(TargetProfile::macos(user, sdk.as_deref())),
            Self::Windows => TargetPlan::Shell(TargetProfile::windows(user)),
            Self::Android => TargetPlan::Shell(TargetProfile::android(user)),
            Self::Custom { profile } => TargetPlan::Shell(profile.clone()),
            Self::Repository {
                patch_dir,
                archive_prefix,
                package,
            } => TargetPlan::Repository(RepositorySettings {
                patch_dir: patch_dir.clone(),
                archive_prefix: archive_prefix.clone(),
                package: package
                    .clone()
                    .unwrap_or_else(|| fallback_package.to_owned()),
            }),
        }
    }

    /// Whether the target is built by a package repository.
    #[must_use]
    pub const fn is_repository(&self) -> bool {
        matches!(self, Self::Repository { .. })
    }

    /// Short label shown by `buildfleet targets`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Macos { .. } => "macos",
            Self::Windows => "windows",
            Self::Android => "android",
            Self::Custom { .. } => "custom",
            Self::Repository { .. } => "repository",
        }
    }
}

impl MachineDirectory {
    /// Reads and validates the directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Read`] when the file cannot be read and
    /// the parse and validation errors of [`Self::from_json`].
    pub fn load(path: &Utf8Path) -> Result<Self, DirectoryError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, path.as_str())
    }

    /// Parses and validates a directory document.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Parse`] for malformed JSON and the
    /// validation errors of [`Self::validate`].
    pub fn from_json(text: &str) -> Result<Self, DirectoryError> {
        Self::parse(text, "<inline>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self, DirectoryError> {
        let directory: Self = serde_json::from_str(text).map_err(|err| DirectoryError::Parse {
            origin: origin.to_owned(),
            message: err.to_string(),
        })?;
        directory.validate()?;
        Ok(directory)
    }

    /// Checks target names, machine references and connection details.
    ///
    /// # Errors
    ///
    /// Returns the first [`DirectoryError`] found, in target order.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        let mut seen = BTreeSet::new();
        for target in &self.targets {
            if !seen.insert(target.name.as_str()) {
                return Err(DirectoryError::DuplicateTarget {
                    name: target.name.clone(),
                });
            }
            if let Some(machine) = target.machine.as_ref()
                && !self.machines.contains_key(machine)
            {
                return Err(DirectoryError::UnknownMachine {
                    target: target.name.clone(),
                    machine: machine.clone(),
                });
            }
            if target.kind.is_repository() {
                continue;
            }
            for (field, value) in [("address", &target.address), ("user", &target.user)] {
                if value.trim().is_empty() {
                    return Err(DirectoryError::MissingField {
                        target: target.name.clone(),
                        field,
                    });
                }
            }
        }
        Ok(())
    }

    /// Profile of the machine named `name`; unknown names are always-on.
    #[must_use]
    pub fn machine(&self, name: &str) -> MachineProfile {
        self.machines.get(name).cloned().unwrap_or_default()
    }

    /// Target named `name`.
    #[must_use]
    pub fn target(&self, name: &str) -> Option<&TargetSpec> {
        self.targets.iter().find(|target| target.name == name)
    }
}
