// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::Command;

use super::{
    CloneOptions, DatasetKind, DatasetName, DestroyMode, Error, FilesystemRecord, MountTable,
    Mountpoint, Storage,
};

const ZFS: &str = "zfs";
const ZPOOL: &str = "zpool";
const MOUNT: &str = "mount";
const UMOUNT: &str = "umount";
const MKDIR: &str = "mkdir";
const RMDIR: &str = "rmdir";
const SUDO: &str = "sudo";
const PROC_MOUNTS: &str = "/proc/mounts";

/// A storage backend that drives the `zfs`, `zpool` and mount utilities.
pub struct ZfsStorage {
    /// Whether state-changing commands must be run through `sudo`.
    escalate: bool,
}

impl ZfsStorage {
    pub fn new() -> Self {
        Self {
            escalate: !running_as_root(),
        }
    }

    /// Build the process for an invocation, escalating when required.
    fn command(&self, invocation: &Invocation) -> Command {
        let mut command = if invocation.privileged && self.escalate {
            let mut sudo = Command::new(SUDO);
            sudo.arg(invocation.program);
            sudo
        } else {
            Command::new(invocation.program)
        };
        command.args(&invocation.args);
        command
    }

    /// Run an invocation to completion, returning its standard output.
    fn run(&self, invocation: Invocation) -> Result<String, Error> {
        let described = invocation.describe();
        tracing::debug!(command = %described, "running");
        let output = self.command(&invocation).output()?;
        if !output.status.success() {
            return Err(Error::Command {
                command: described,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run an invocation whose exit status is the answer.
    fn succeeds(&self, invocation: Invocation) -> Result<bool, Error> {
        tracing::debug!(command = %invocation.describe(), "checking");
        let output = self.command(&invocation).output()?;
        Ok(output.status.success())
    }
}

impl Default for ZfsStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for ZfsStorage {
    fn root_dataset(&self) -> Result<DatasetName, Error> {
        read_rootfs(Path::new(PROC_MOUNTS))?.ok_or(Error::NoActiveBootEnvironment)
    }

    fn dataset_exists(&self, dataset: &DatasetName) -> Result<bool, Error> {
        self.succeeds(
            Invocation::query(ZFS)
                .args(["list", "-H", "-o", "name"])
                .arg(dataset.as_str()),
        )
    }

    fn list_datasets(&self, root: &DatasetName, kind: DatasetKind) -> Result<Vec<String>, Error> {
        let mut invocation = Invocation::query(ZFS).args(["list", "-H", "-o", "name"]);
        if kind == DatasetKind::Snapshot {
            invocation = invocation.args(["-t", "snapshot"]);
        }
        let stdout = self.run(invocation.arg("-r").arg(root.as_str()))?;
        Ok(parse_names(&stdout))
    }

    fn list_filesystems(&self, root: &DatasetName) -> Result<Vec<FilesystemRecord>, Error> {
        let invocation = Invocation::query(ZFS)
            .args(["list", "-H", "-o", "name,mountpoint", "-r"])
            .arg(root.as_str());
        let described = invocation.describe();
        let stdout = self.run(invocation)?;
        parse_filesystems(&described, &stdout)
    }

    fn snapshot(&self, snapshot: &DatasetName, recursive: bool) -> Result<(), Error> {
        let mut invocation = Invocation::privileged(ZFS).arg("snapshot");
        if recursive {
            invocation = invocation.arg("-r");
        }
        self.run(invocation.arg(snapshot.as_str())).map(drop)
    }

    fn clone_snapshot(
        &self,
        snapshot: &DatasetName,
        target: &DatasetName,
        options: &CloneOptions,
    ) -> Result<(), Error> {
        self.run(clone_invocation(snapshot, target, options))
            .map(drop)
    }

    fn destroy(&self, target: &DatasetName, mode: DestroyMode) -> Result<(), Error> {
        let mut invocation = Invocation::privileged(ZFS).arg("destroy");
        match mode {
            DestroyMode::Single => {}
            DestroyMode::Recursive => invocation = invocation.arg("-r"),
            DestroyMode::Dependents => invocation = invocation.arg("-R"),
        }
        self.run(invocation.arg(target.as_str())).map(drop)
    }

    fn pool_property(&self, pool: &str, property: &str) -> Result<String, Error> {
        let stdout = self.run(
            Invocation::query(ZPOOL)
                .args(["get", "-H", "-o", "value", property, pool]),
        )?;
        Ok(stdout.trim().to_string())
    }

    fn set_pool_property(&self, pool: &str, property: &str, value: &str) -> Result<(), Error> {
        self.run(
            Invocation::privileged(ZPOOL)
                .arg("set")
                .arg(format!("{}={}", property, value))
                .arg(pool),
        )
        .map(drop)
    }

    fn mount_table(&self) -> Result<MountTable, Error> {
        let invocation = Invocation::query(ZFS).arg("mount");
        let described = invocation.describe();
        let stdout = self.run(invocation)?;
        parse_mount_table(&described, &stdout)
    }

    fn mount(&self, dataset: &DatasetName, mountpoint: &Path, fstype: &str) -> Result<(), Error> {
        self.run(
            Invocation::privileged(MOUNT)
                .args(["-t", fstype, "-o", "zfsutil"])
                .arg(dataset.as_str())
                .arg(mountpoint),
        )
        .map(drop)
    }

    fn unmount(&self, mountpoint: &Path, recursive: bool) -> Result<(), Error> {
        let mut invocation = Invocation::privileged(UMOUNT);
        if recursive {
            invocation = invocation.arg("-R");
        }
        self.run(invocation.arg(mountpoint)).map(drop)
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn make_directory(&self, path: &Path) -> Result<(), Error> {
        self.run(Invocation::privileged(MKDIR).arg(path)).map(drop)
    }

    fn remove_directory(&self, path: &Path) -> Result<(), Error> {
        self.run(Invocation::privileged(RMDIR).arg(path)).map(drop)
    }
}

/// `zfs clone` with the properties a clone starts out with. A mountpoint of
/// `-` is left for ZFS to decide.
fn clone_invocation(
    snapshot: &DatasetName,
    target: &DatasetName,
    options: &CloneOptions,
) -> Invocation {
    let mut invocation = Invocation::privileged(ZFS)
        .arg("clone")
        .arg("-o")
        .arg(format!("canmount={}", options.canmount));
    if options.mountpoint != Mountpoint::Absent {
        invocation = invocation
            .arg("-o")
            .arg(format!("mountpoint={}", options.mountpoint));
    }
    invocation.arg(snapshot.as_str()).arg(target.as_str())
}

/// A single external command as an argument vector.
struct Invocation {
    program: &'static str,
    args: Vec<OsString>,
    privileged: bool,
}

impl Invocation {
    /// A read-only command, run with the caller's own privileges.
    fn query(program: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
            privileged: false,
        }
    }

    /// A state-changing command that needs root.
    fn privileged(program: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
            privileged: true,
        }
    }

    fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// A human-readable rendering for logs and error messages.
    fn describe(&self) -> String {
        let mut described = self.program.to_string();
        for arg in &self.args {
            described.push(' ');
            described.push_str(&arg.to_string_lossy());
        }
        described
    }
}

/// Parse one dataset name per line.
pub fn parse_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `zfs list -H -o name,mountpoint` output.
pub fn parse_filesystems(command: &str, stdout: &str) -> Result<Vec<FilesystemRecord>, Error> {
    let mut records = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (dataset, mountpoint) = line.split_once('\t').ok_or_else(|| Error::Parse {
            command: command.to_string(),
            line: line.to_string(),
        })?;
        records.push(FilesystemRecord {
            dataset: dataset.to_string(),
            mountpoint: Mountpoint::parse(mountpoint),
        });
    }
    Ok(records)
}

/// Parse `zfs mount` output: a dataset and its mountpoint per line, separated
/// by whitespace.
pub fn parse_mount_table(command: &str, stdout: &str) -> Result<MountTable, Error> {
    let mut table = MountTable::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (None, _, _) => continue,
            (Some(dataset), Some(mountpoint), None) => {
                table.insert(dataset.to_string(), mountpoint.into());
            }
            _ => {
                return Err(Error::Parse {
                    command: command.to_string(),
                    line: line.to_string(),
                });
            }
        }
    }
    Ok(table)
}

/// Get the root ZFS filesystem, if any, from a `/proc/mounts`-style file.
pub fn read_rootfs(path: &Path) -> Result<Option<DatasetName>, Error> {
    let file = File::open(path)?;
    let mut rootfs = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let device = parts[0];
        let mountpoint = parts[1];
        let fstype = parts[2];

        // Later entries shadow earlier ones mounted at the same place.
        if mountpoint == "/" {
            rootfs = (fstype == "zfs").then(|| device.to_string());
        }
    }
    match rootfs {
        Some(device) => DatasetName::reported(&device).map(Some),
        None => Ok(None),
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}
