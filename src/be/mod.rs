// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error as ThisError;

pub mod dataset;
pub mod lifecycle;
pub mod mock;
pub mod registry;
pub mod validation;
pub mod zfs;

pub use dataset::DatasetName;

/// Directory under which boot environments are mounted for maintenance.
pub const STAGING_ROOT: &str = "/mnt";

/// Prefix of the snapshot tag recording which boot environment another one
/// was cloned from.
pub const LINEAGE_PREFIX: &str = "beadm-clone-";

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Boot environment '{name}' does not exist")]
    NotFound { name: String },

    #[error("Boot environment '{name}' already exists")]
    Conflict { name: String },

    #[error("'{name}' is not a valid boot environment name: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Cannot destroy the running boot environment '{name}'")]
    CannotDestroyCurrent { name: String },

    #[error("Boot environment '{name}' is already mounted")]
    AlreadyMounted { name: String },

    #[error("Failed to unmount boot environment '{name}'. Is something using it?")]
    Busy { name: String },

    #[error("/ is not a ZFS boot environment")]
    NoActiveBootEnvironment,

    #[error("zpool bootfs '{value}' does not look like a boot environment")]
    InvalidBootfs { value: String },

    /// A failure after storage state may already have been changed.
    #[error("{message}")]
    Fatal { message: String },

    #[error("'{command}' failed (exit code {code}){}", format_stderr(.stderr))]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Unexpected output from '{command}': {line:?}")]
    Parse { command: String, line: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

impl Error {
    pub fn not_found(be_name: &str) -> Self {
        Error::NotFound {
            name: be_name.to_string(),
        }
    }

    pub fn conflict(be_name: &str) -> Self {
        Error::Conflict {
            name: be_name.to_string(),
        }
    }

    pub fn already_mounted(be_name: &str) -> Self {
        Error::AlreadyMounted {
            name: be_name.to_string(),
        }
    }

    pub fn busy(be_name: &str) -> Self {
        Error::Busy {
            name: be_name.to_string(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Fatal {
            message: message.into(),
        }
    }

    /// A fatal error raised after a partial mutation that could not be fully
    /// compensated.
    pub fn needs_cleanup(message: &str) -> Self {
        Error::Fatal {
            message: format!("{}. Manual cleanup may be required.", message),
        }
    }

    /// Whether this error must be handed to an operator rather than retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

/// The result of a lifecycle operation that did not fail fatally.
#[must_use]
#[derive(Debug)]
pub enum Outcome {
    /// Storage state was changed as requested.
    Applied,
    /// The requested state was already in place; nothing was changed.
    Unchanged,
    /// A precondition did not hold; nothing was changed.
    Rejected(Error),
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Outcome::Rejected(_))
    }

    /// The reason for a rejection, if any.
    pub fn rejection(&self) -> Option<&Error> {
        match self {
            Outcome::Rejected(err) => Some(err),
            _ => None,
        }
    }
}

/// The value of a filesystem's `mountpoint` property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mountpoint {
    Path(PathBuf),
    /// `legacy`: mounted through fstab rather than by ZFS.
    Legacy,
    /// `none`: never mounted.
    Disabled,
    /// `-`: the dataset type has no mountpoint (e.g. a volume).
    Absent,
}

impl Mountpoint {
    pub fn parse(value: &str) -> Self {
        match value {
            "legacy" => Mountpoint::Legacy,
            "none" => Mountpoint::Disabled,
            "-" | "" => Mountpoint::Absent,
            path => Mountpoint::Path(PathBuf::from(path)),
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Mountpoint::Path(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for Mountpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mountpoint::Path(path) => write!(f, "{}", path.display()),
            Mountpoint::Legacy => write!(f, "legacy"),
            Mountpoint::Disabled => write!(f, "none"),
            Mountpoint::Absent => write!(f, "-"),
        }
    }
}

/// A filesystem and its configured mountpoint, as listed by `zfs list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilesystemRecord {
    pub dataset: String,
    pub mountpoint: Mountpoint,
}

/// Live mounts of ZFS filesystems, keyed by dataset name.
pub type MountTable = BTreeMap<String, PathBuf>;

/// Which kind of dataset a listing returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Snapshot,
}

/// How far a destroy reaches beyond its target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DestroyMode {
    /// Only the target itself.
    Single,
    /// The target and all descendants (`zfs destroy -r`).
    Recursive,
    /// Descendants plus every clone depending on them (`zfs destroy -R`).
    Dependents,
}

/// The `canmount` property.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanMount {
    On,
    Off,
    NoAuto,
}

impl fmt::Display for CanMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanMount::On => write!(f, "on"),
            CanMount::Off => write!(f, "off"),
            CanMount::NoAuto => write!(f, "noauto"),
        }
    }
}

/// Properties applied to a new clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneOptions {
    pub canmount: CanMount,
    pub mountpoint: Mountpoint,
}

impl CloneOptions {
    /// Options for a clone that keeps `mountpoint` but never mounts itself.
    pub fn inert(mountpoint: Mountpoint) -> Self {
        Self {
            canmount: CanMount::NoAuto,
            mountpoint,
        }
    }
}

/// Storage and mount operations the lifecycle manager is built from.
///
/// Implementations only translate between calls and the underlying system;
/// they never decide what a result means for a boot environment. Mutating
/// operations take care of any privilege escalation themselves.
pub trait Storage {
    /// The dataset backing the live root filesystem.
    fn root_dataset(&self) -> Result<DatasetName, Error>;

    fn dataset_exists(&self, dataset: &DatasetName) -> Result<bool, Error>;

    /// Recursively list datasets of `kind` under (and including) `root`.
    fn list_datasets(&self, root: &DatasetName, kind: DatasetKind) -> Result<Vec<String>, Error>;

    /// Recursively list filesystems under (and including) `root` with their
    /// configured mountpoints, parents before children.
    fn list_filesystems(&self, root: &DatasetName) -> Result<Vec<FilesystemRecord>, Error>;

    fn snapshot(&self, snapshot: &DatasetName, recursive: bool) -> Result<(), Error>;

    fn clone_snapshot(
        &self,
        snapshot: &DatasetName,
        target: &DatasetName,
        options: &CloneOptions,
    ) -> Result<(), Error>;

    fn destroy(&self, target: &DatasetName, mode: DestroyMode) -> Result<(), Error>;

    fn pool_property(&self, pool: &str, property: &str) -> Result<String, Error>;

    fn set_pool_property(&self, pool: &str, property: &str, value: &str) -> Result<(), Error>;

    fn mount_table(&self) -> Result<MountTable, Error>;

    fn mount(&self, dataset: &DatasetName, mountpoint: &Path, fstype: &str) -> Result<(), Error>;

    fn unmount(&self, mountpoint: &Path, recursive: bool) -> Result<(), Error>;

    fn directory_exists(&self, path: &Path) -> bool;

    fn make_directory(&self, path: &Path) -> Result<(), Error>;

    fn remove_directory(&self, path: &Path) -> Result<(), Error>;
}

/// The snapshot tag recording that `dest` was cloned from `source`.
pub fn lineage_tag(source: &str, dest: &str) -> String {
    format!("{}{}-to-{}", LINEAGE_PREFIX, source, dest)
}

/// Whether `snapshot` is a lineage snapshot with `be_name` as its source or
/// destination.
pub fn is_lineage_of(snapshot: &str, be_name: &str) -> bool {
    let Some((_, tag)) = snapshot.split_once('@') else {
        return false;
    };
    match tag.strip_prefix(LINEAGE_PREFIX) {
        Some(rest) => {
            rest.starts_with(&format!("{}-to-", be_name))
                || rest.ends_with(&format!("-to-{}", be_name))
        }
        None => false,
    }
}

/// The directory a boot environment is mounted at for maintenance.
pub fn staging_dir(be_name: &str) -> PathBuf {
    Path::new(STAGING_ROOT).join(be_name)
}

/// Map a configured mountpoint into a boot environment's staging directory.
/// Only real paths can be remapped.
pub fn staged_mountpoint(be_name: &str, mountpoint: &Mountpoint) -> Option<PathBuf> {
    let path = mountpoint.as_path()?;
    let staging = staging_dir(be_name);
    match path.strip_prefix("/") {
        Ok(relative) if relative.as_os_str().is_empty() => Some(staging),
        Ok(relative) => Some(staging.join(relative)),
        Err(_) => Some(staging.join(path)),
    }
}
