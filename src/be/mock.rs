// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::{
    CanMount, CloneOptions, DatasetKind, DatasetName, DestroyMode, Error, FilesystemRecord,
    MountTable, Mountpoint, Storage,
};

/// A filesystem held by the emulator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmulatedFilesystem {
    pub name: String,
    pub mountpoint: Mountpoint,
    pub canmount: CanMount,
    /// The snapshot this filesystem was cloned from, if any.
    pub origin: Option<String>,
}

/// A state-changing call made against the emulator, recorded whether or not
/// it succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Snapshot {
        snapshot: String,
        recursive: bool,
    },
    Clone {
        snapshot: String,
        target: String,
        options: CloneOptions,
    },
    Destroy {
        target: String,
        mode: DestroyMode,
    },
    SetPoolProperty {
        pool: String,
        property: String,
        value: String,
    },
    Mount {
        dataset: String,
        mountpoint: PathBuf,
    },
    Unmount {
        mountpoint: PathBuf,
        recursive: bool,
    },
    MakeDirectory(PathBuf),
    RemoveDirectory(PathBuf),
}

/// A failure to inject into the emulator. Each one stays armed until
/// [`EmulatorStorage::clear_faults`] is called.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail snapshots with this full name.
    Snapshot(String),
    /// Fail clones onto this target dataset.
    Clone(String),
    /// Fail destroying this target.
    Destroy(String),
    /// Fail mounting this dataset.
    Mount(String),
    /// Fail unmounting at this path.
    Unmount(PathBuf),
    MakeDirectory(PathBuf),
    RemoveDirectory(PathBuf),
}

#[derive(Default)]
struct State {
    rootfs: String,
    filesystems: Vec<EmulatedFilesystem>,
    snapshots: Vec<String>,
    pool_properties: BTreeMap<(String, String), String>,
    mounts: Vec<(String, PathBuf)>,
    directories: BTreeSet<PathBuf>,
    faults: Vec<Fault>,
    calls: Vec<Call>,
}

/// A storage backend that emulates ZFS datasets, pool properties, the mount
/// table and directories entirely in memory, with no side effects.
pub struct EmulatorStorage {
    state: RwLock<State>,
}

impl EmulatorStorage {
    /// An emulator whose live root filesystem is `rootfs`. Nothing else
    /// exists yet, not even `rootfs`.
    pub fn new(rootfs: &str) -> Self {
        let mut directories = BTreeSet::new();
        directories.insert(PathBuf::from("/"));
        directories.insert(PathBuf::from(super::STAGING_ROOT));
        Self {
            state: RwLock::new(State {
                rootfs: rootfs.to_string(),
                directories,
                ..State::default()
            }),
        }
    }

    /// A pool `zfake` running boot environment `default` (with separate `usr`
    /// and `var` datasets) and an inactive `alt` cloned from it.
    pub fn sampled() -> Self {
        let tag = "beadm-clone-default-to-alt";
        Self::new("zfake/ROOT/default")
            .with_filesystem("zfake", "none", CanMount::Off)
            .with_filesystem("zfake/ROOT", "none", CanMount::Off)
            .with_filesystem("zfake/ROOT/default", "/", CanMount::NoAuto)
            .with_filesystem("zfake/ROOT/default/usr", "/usr", CanMount::On)
            .with_filesystem("zfake/ROOT/default/var", "/var", CanMount::On)
            .with_filesystem("zfake/home", "/home", CanMount::On)
            .with_snapshot(&format!("zfake/ROOT/default@{}", tag))
            .with_snapshot(&format!("zfake/ROOT/default/usr@{}", tag))
            .with_snapshot(&format!("zfake/ROOT/default/var@{}", tag))
            .with_clone(&format!("zfake/ROOT/default@{}", tag), "zfake/ROOT/alt", "/")
            .with_clone(
                &format!("zfake/ROOT/default/usr@{}", tag),
                "zfake/ROOT/alt/usr",
                "/usr",
            )
            .with_clone(
                &format!("zfake/ROOT/default/var@{}", tag),
                "zfake/ROOT/alt/var",
                "/var",
            )
            .with_mount("zfake/ROOT/default", "/")
            .with_mount("zfake/ROOT/default/usr", "/usr")
            .with_mount("zfake/ROOT/default/var", "/var")
            .with_mount("zfake/home", "/home")
            .with_pool_property("zfake", "bootfs", "zfake/ROOT/default")
    }

    pub fn with_filesystem(self, name: &str, mountpoint: &str, canmount: CanMount) -> Self {
        self.state.write().unwrap().insert(EmulatedFilesystem {
            name: name.to_string(),
            mountpoint: Mountpoint::parse(mountpoint),
            canmount,
            origin: None,
        });
        self
    }

    pub fn with_clone(self, origin: &str, name: &str, mountpoint: &str) -> Self {
        self.state.write().unwrap().insert(EmulatedFilesystem {
            name: name.to_string(),
            mountpoint: Mountpoint::parse(mountpoint),
            canmount: CanMount::NoAuto,
            origin: Some(origin.to_string()),
        });
        self
    }

    pub fn with_snapshot(self, name: &str) -> Self {
        self.state.write().unwrap().snapshots.push(name.to_string());
        self
    }

    pub fn with_mount(self, dataset: &str, mountpoint: &str) -> Self {
        self.state
            .write()
            .unwrap()
            .mounts
            .push((dataset.to_string(), PathBuf::from(mountpoint)));
        self
    }

    pub fn with_pool_property(self, pool: &str, property: &str, value: &str) -> Self {
        self.state
            .write()
            .unwrap()
            .pool_properties
            .insert((pool.to_string(), property.to_string()), value.to_string());
        self
    }

    pub fn with_directory(self, path: &str) -> Self {
        self.state
            .write()
            .unwrap()
            .directories
            .insert(PathBuf::from(path));
        self
    }

    /// Arm a fault.
    pub fn inject(&self, fault: Fault) {
        self.state.write().unwrap().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state.write().unwrap().faults.clear();
    }

    /// State-changing calls made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.read().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.write().unwrap().calls.clear();
    }

    pub fn filesystem(&self, name: &str) -> Option<EmulatedFilesystem> {
        self.state
            .read()
            .unwrap()
            .filesystems
            .iter()
            .find(|fs| fs.name == name)
            .cloned()
    }

    /// Every filesystem and snapshot name, sorted.
    pub fn datasets(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut names: Vec<String> = state
            .filesystems
            .iter()
            .map(|fs| fs.name.clone())
            .chain(state.snapshots.iter().cloned())
            .collect();
        names.sort();
        names
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.state
            .read()
            .unwrap()
            .directories
            .iter()
            .cloned()
            .collect()
    }
}

impl State {
    fn insert(&mut self, filesystem: EmulatedFilesystem) {
        self.filesystems.push(filesystem);
        // Listings are hierarchical: parents sort before their children.
        self.filesystems
            .sort_by(|a, b| hierarchy_key(&a.name).cmp(&hierarchy_key(&b.name)));
    }

    fn has_filesystem(&self, name: &str) -> bool {
        self.filesystems.iter().any(|fs| fs.name == name)
    }

    fn has_snapshot(&self, name: &str) -> bool {
        self.snapshots.iter().any(|snap| snap == name)
    }

    fn check(&self, fault: Fault, command: &str) -> Result<(), Error> {
        if self.faults.contains(&fault) {
            return Err(failure(command, "injected failure"));
        }
        Ok(())
    }

    /// Filesystems at or below `root`.
    fn subtree(&self, root: &str) -> Vec<String> {
        self.filesystems
            .iter()
            .filter(|fs| is_within(&fs.name, root))
            .map(|fs| fs.name.clone())
            .collect()
    }

    /// Snapshots of any filesystem in `filesystems`.
    fn snapshots_of(&self, filesystems: &BTreeSet<String>) -> Vec<String> {
        self.snapshots
            .iter()
            .filter(|snap| {
                snap.split_once('@')
                    .is_some_and(|(dataset, _)| filesystems.contains(dataset))
            })
            .cloned()
            .collect()
    }

    /// Work out everything a destroy of `target` removes, failing as ZFS
    /// would when something outside the allowed reach depends on it.
    fn removal_set(
        &self,
        target: &str,
        mode: DestroyMode,
        command: &str,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>), Error> {
        let mut filesystems = BTreeSet::new();
        let mut snapshots = BTreeSet::new();

        if let Some((dataset, tag)) = target.split_once('@') {
            if !self.has_snapshot(target) {
                return Err(failure(command, "could not find any snapshots to destroy"));
            }
            snapshots.insert(target.to_string());
            if mode != DestroyMode::Single {
                for fs in self.subtree(dataset) {
                    let snapshot = format!("{}@{}", fs, tag);
                    if self.has_snapshot(&snapshot) {
                        snapshots.insert(snapshot);
                    }
                }
            }
        } else {
            if !self.has_filesystem(target) {
                return Err(failure(command, "dataset does not exist"));
            }
            if mode == DestroyMode::Single {
                let only = BTreeSet::from([target.to_string()]);
                if self.subtree(target).len() > 1 || !self.snapshots_of(&only).is_empty() {
                    return Err(failure(command, "filesystem has children"));
                }
                filesystems.insert(target.to_string());
            } else {
                filesystems.extend(self.subtree(target));
            }
            snapshots.extend(self.snapshots_of(&filesystems));
        }

        loop {
            let dependents: Vec<String> = self
                .filesystems
                .iter()
                .filter(|fs| !filesystems.contains(&fs.name))
                .filter(|fs| fs.origin.as_ref().is_some_and(|o| snapshots.contains(o)))
                .map(|fs| fs.name.clone())
                .collect();
            if dependents.is_empty() {
                break;
            }
            if mode != DestroyMode::Dependents {
                return Err(failure(command, "snapshot has dependent clones"));
            }
            for dependent in dependents {
                filesystems.extend(self.subtree(&dependent));
            }
            snapshots.extend(self.snapshots_of(&filesystems));
        }

        Ok((filesystems, snapshots))
    }
}

impl Storage for EmulatorStorage {
    fn root_dataset(&self) -> Result<DatasetName, Error> {
        DatasetName::reported(&self.state.read().unwrap().rootfs)
    }

    fn dataset_exists(&self, dataset: &DatasetName) -> Result<bool, Error> {
        let state = self.state.read().unwrap();
        Ok(state.has_filesystem(dataset.as_str()) || state.has_snapshot(dataset.as_str()))
    }

    fn list_datasets(&self, root: &DatasetName, kind: DatasetKind) -> Result<Vec<String>, Error> {
        let state = self.state.read().unwrap();
        if !state.has_filesystem(root.as_str()) {
            return Err(failure(
                &format!("zfs list -H -o name -r {}", root),
                "dataset does not exist",
            ));
        }
        match kind {
            DatasetKind::Filesystem => Ok(state.subtree(root.as_str())),
            DatasetKind::Snapshot => {
                let mut snapshots: Vec<&String> = state
                    .snapshots
                    .iter()
                    .filter(|snap| is_within(snap, root.as_str()))
                    .collect();
                // Stable, so each dataset's snapshots stay in creation order.
                snapshots.sort_by(|a, b| hierarchy_key(a).cmp(&hierarchy_key(b)));
                Ok(snapshots.into_iter().cloned().collect())
            }
        }
    }

    fn list_filesystems(&self, root: &DatasetName) -> Result<Vec<FilesystemRecord>, Error> {
        let state = self.state.read().unwrap();
        if !state.has_filesystem(root.as_str()) {
            return Err(failure(
                &format!("zfs list -H -o name,mountpoint -r {}", root),
                "dataset does not exist",
            ));
        }
        Ok(state
            .filesystems
            .iter()
            .filter(|fs| is_within(&fs.name, root.as_str()))
            .map(|fs| FilesystemRecord {
                dataset: fs.name.clone(),
                mountpoint: fs.mountpoint.clone(),
            })
            .collect())
    }

    fn snapshot(&self, snapshot: &DatasetName, recursive: bool) -> Result<(), Error> {
        let command = format!("zfs snapshot {}", snapshot);
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::Snapshot {
            snapshot: snapshot.to_string(),
            recursive,
        });
        state.check(Fault::Snapshot(snapshot.to_string()), &command)?;

        let Some((dataset, tag)) = snapshot.as_str().split_once('@') else {
            return Err(failure(&command, "not a snapshot name"));
        };
        if !state.has_filesystem(dataset) {
            return Err(failure(&command, "dataset does not exist"));
        }
        let sources = if recursive {
            state.subtree(dataset)
        } else {
            vec![dataset.to_string()]
        };
        let created: Vec<String> = sources
            .iter()
            .map(|source| format!("{}@{}", source, tag))
            .collect();
        if created.iter().any(|snap| state.has_snapshot(snap)) {
            return Err(failure(&command, "dataset already exists"));
        }
        state.snapshots.extend(created);
        Ok(())
    }

    fn clone_snapshot(
        &self,
        snapshot: &DatasetName,
        target: &DatasetName,
        options: &CloneOptions,
    ) -> Result<(), Error> {
        let command = format!("zfs clone {} {}", snapshot, target);
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::Clone {
            snapshot: snapshot.to_string(),
            target: target.to_string(),
            options: options.clone(),
        });
        state.check(Fault::Clone(target.to_string()), &command)?;

        if !state.has_snapshot(snapshot.as_str()) {
            return Err(failure(&command, "dataset does not exist"));
        }
        if state.has_filesystem(target.as_str()) {
            return Err(failure(&command, "dataset already exists"));
        }
        match target.parent() {
            Some(parent) if state.has_filesystem(parent.as_str()) => {}
            _ => return Err(failure(&command, "parent does not exist")),
        }
        state.insert(EmulatedFilesystem {
            name: target.to_string(),
            mountpoint: options.mountpoint.clone(),
            canmount: options.canmount,
            origin: Some(snapshot.to_string()),
        });
        Ok(())
    }

    fn destroy(&self, target: &DatasetName, mode: DestroyMode) -> Result<(), Error> {
        let command = format!("zfs destroy {}", target);
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::Destroy {
            target: target.to_string(),
            mode,
        });
        state.check(Fault::Destroy(target.to_string()), &command)?;

        let (filesystems, snapshots) = state.removal_set(target.as_str(), mode, &command)?;
        state.filesystems.retain(|fs| !filesystems.contains(&fs.name));
        state.snapshots.retain(|snap| !snapshots.contains(snap));
        // Destroying a filesystem unmounts it first.
        state
            .mounts
            .retain(|(dataset, _)| !filesystems.contains(dataset));
        Ok(())
    }

    fn pool_property(&self, pool: &str, property: &str) -> Result<String, Error> {
        let state = self.state.read().unwrap();
        Ok(state
            .pool_properties
            .get(&(pool.to_string(), property.to_string()))
            .cloned()
            .unwrap_or_else(|| "-".to_string()))
    }

    fn set_pool_property(&self, pool: &str, property: &str, value: &str) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::SetPoolProperty {
            pool: pool.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        });
        state
            .pool_properties
            .insert((pool.to_string(), property.to_string()), value.to_string());
        Ok(())
    }

    fn mount_table(&self) -> Result<MountTable, Error> {
        Ok(self
            .state
            .read()
            .unwrap()
            .mounts
            .iter()
            .cloned()
            .collect())
    }

    fn mount(&self, dataset: &DatasetName, mountpoint: &Path, fstype: &str) -> Result<(), Error> {
        let command = format!("mount -t {} {} {}", fstype, dataset, mountpoint.display());
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::Mount {
            dataset: dataset.to_string(),
            mountpoint: mountpoint.to_path_buf(),
        });
        state.check(Fault::Mount(dataset.to_string()), &command)?;

        if fstype != "zfs" {
            return Err(failure(&command, "unknown filesystem type"));
        }
        if !state.has_filesystem(dataset.as_str()) {
            return Err(failure(&command, "dataset does not exist"));
        }
        if state.mounts.iter().any(|(ds, _)| ds == dataset.as_str()) {
            return Err(failure(&command, "filesystem already mounted"));
        }
        state
            .mounts
            .push((dataset.to_string(), mountpoint.to_path_buf()));
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path, recursive: bool) -> Result<(), Error> {
        let command = format!("umount {}", mountpoint.display());
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::Unmount {
            mountpoint: mountpoint.to_path_buf(),
            recursive,
        });
        state.check(Fault::Unmount(mountpoint.to_path_buf()), &command)?;

        if !state.mounts.iter().any(|(_, path)| path == mountpoint) {
            return Err(failure(&command, "not mounted"));
        }
        let beneath = |path: &PathBuf| path.starts_with(mountpoint) && path != mountpoint;
        if !recursive && state.mounts.iter().any(|(_, path)| beneath(path)) {
            return Err(failure(&command, "target is busy"));
        }
        state
            .mounts
            .retain(|(_, path)| !path.starts_with(mountpoint));
        Ok(())
    }

    fn directory_exists(&self, path: &Path) -> bool {
        self.state.read().unwrap().directories.contains(path)
    }

    fn make_directory(&self, path: &Path) -> Result<(), Error> {
        let command = format!("mkdir {}", path.display());
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::MakeDirectory(path.to_path_buf()));
        state.check(Fault::MakeDirectory(path.to_path_buf()), &command)?;

        if state.directories.contains(path) {
            return Err(failure(&command, "File exists"));
        }
        match path.parent() {
            Some(parent) if state.directories.contains(parent) => {}
            _ => return Err(failure(&command, "No such file or directory")),
        }
        state.directories.insert(path.to_path_buf());
        Ok(())
    }

    fn remove_directory(&self, path: &Path) -> Result<(), Error> {
        let command = format!("rmdir {}", path.display());
        let mut state = self.state.write().unwrap();
        state.calls.push(Call::RemoveDirectory(path.to_path_buf()));
        state.check(Fault::RemoveDirectory(path.to_path_buf()), &command)?;

        if !state.directories.contains(path) {
            return Err(failure(&command, "No such file or directory"));
        }
        if state.mounts.iter().any(|(_, mp)| mp.starts_with(path)) {
            return Err(failure(&command, "Device or resource busy"));
        }
        if state
            .directories
            .iter()
            .any(|dir| dir.starts_with(path) && dir != path)
        {
            return Err(failure(&command, "Directory not empty"));
        }
        state.directories.remove(path);
        Ok(())
    }
}

fn failure(command: &str, stderr: &str) -> Error {
    Error::Command {
        command: command.to_string(),
        code: 1,
        stderr: stderr.to_string(),
    }
}

/// Whether dataset or snapshot `name` is `root` or lies beneath it.
fn is_within(name: &str, root: &str) -> bool {
    match name.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('@'),
        None => false,
    }
}

/// Sort key placing parents before children, ignoring any snapshot part.
fn hierarchy_key(name: &str) -> Vec<&str> {
    let dataset = name.split_once('@').map_or(name, |(dataset, _)| dataset);
    dataset.split('/').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str) -> DatasetName {
        DatasetName::new(name).unwrap()
    }

    #[test]
    fn test_emulated_listing() {
        let storage = EmulatorStorage::sampled();
        assert_eq!(
            storage
                .list_datasets(&ds("zfake/ROOT"), DatasetKind::Filesystem)
                .unwrap(),
            vec![
                "zfake/ROOT",
                "zfake/ROOT/alt",
                "zfake/ROOT/alt/usr",
                "zfake/ROOT/alt/var",
                "zfake/ROOT/default",
                "zfake/ROOT/default/usr",
                "zfake/ROOT/default/var",
            ]
        );
        assert_eq!(
            storage
                .list_datasets(&ds("zfake/ROOT"), DatasetKind::Snapshot)
                .unwrap()
                .len(),
            3
        );
        assert!(
            storage
                .list_datasets(&ds("zfake/nope"), DatasetKind::Filesystem)
                .is_err()
        );

        let records = storage.list_filesystems(&ds("zfake/ROOT/default")).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].mountpoint, Mountpoint::parse("/"));
        assert_eq!(records[2].dataset, "zfake/ROOT/default/var");
    }

    #[test]
    fn test_emulated_snapshot_recursive() {
        let storage = EmulatorStorage::sampled();
        storage
            .snapshot(&ds("zfake/ROOT/default@now"), true)
            .unwrap();
        let datasets = storage.datasets();
        assert!(datasets.contains(&"zfake/ROOT/default@now".to_string()));
        assert!(datasets.contains(&"zfake/ROOT/default/usr@now".to_string()));
        assert!(datasets.contains(&"zfake/ROOT/default/var@now".to_string()));

        // The same snapshot cannot be taken twice.
        assert!(storage.snapshot(&ds("zfake/ROOT/default@now"), true).is_err());

        storage.snapshot(&ds("zfake/ROOT/alt@solo"), false).unwrap();
        assert!(!storage.datasets().contains(&"zfake/ROOT/alt/usr@solo".to_string()));
    }

    #[test]
    fn test_emulated_clone() {
        let storage = EmulatorStorage::sampled();
        let options = CloneOptions::inert(Mountpoint::parse("/"));
        storage
            .clone_snapshot(
                &ds("zfake/ROOT/default@beadm-clone-default-to-alt"),
                &ds("zfake/ROOT/other"),
                &options,
            )
            .unwrap();
        let fs = storage.filesystem("zfake/ROOT/other").unwrap();
        assert_eq!(fs.canmount, CanMount::NoAuto);
        assert_eq!(
            fs.origin.as_deref(),
            Some("zfake/ROOT/default@beadm-clone-default-to-alt")
        );

        // Existing target, missing parent and missing snapshot all fail.
        let snap = ds("zfake/ROOT/default@beadm-clone-default-to-alt");
        assert!(storage.clone_snapshot(&snap, &ds("zfake/ROOT/other"), &options).is_err());
        assert!(storage.clone_snapshot(&snap, &ds("zfake/ROOT/x/y"), &options).is_err());
        assert!(
            storage
                .clone_snapshot(&ds("zfake/ROOT/default@nope"), &ds("zfake/ROOT/z"), &options)
                .is_err()
        );
    }

    #[test]
    fn test_emulated_destroy_modes() {
        let storage = EmulatorStorage::sampled();
        let snap = ds("zfake/ROOT/default@beadm-clone-default-to-alt");

        // The lineage snapshot has clones, so only -R may remove it.
        assert!(storage.destroy(&snap, DestroyMode::Single).is_err());
        assert!(storage.destroy(&snap, DestroyMode::Recursive).is_err());
        // A filesystem with children needs -r.
        assert!(storage.destroy(&ds("zfake/ROOT/alt"), DestroyMode::Single).is_err());

        storage.destroy(&snap, DestroyMode::Dependents).unwrap();
        let datasets = storage.datasets();
        assert!(!datasets.iter().any(|name| name.starts_with("zfake/ROOT/alt")));
        assert!(!datasets.iter().any(|name| name.contains('@')));
        assert!(datasets.contains(&"zfake/ROOT/default/usr".to_string()));
    }

    #[test]
    fn test_emulated_destroy_recursive_filesystem() {
        let storage = EmulatorStorage::sampled();
        storage
            .destroy(&ds("zfake/ROOT/alt"), DestroyMode::Recursive)
            .unwrap();
        assert!(storage.filesystem("zfake/ROOT/alt/usr").is_none());
        // The origin snapshots belong to default and survive.
        assert_eq!(
            storage
                .list_datasets(&ds("zfake/ROOT"), DatasetKind::Snapshot)
                .unwrap()
                .len(),
            3
        );
        // A leftover snapshot still blocks a non-recursive destroy.
        assert!(
            storage
                .destroy(&ds("zfake/ROOT/default/var"), DestroyMode::Single)
                .is_err()
        );
    }

    #[test]
    fn test_emulated_mount_and_unmount() {
        let storage = EmulatorStorage::sampled();
        storage.make_directory(Path::new("/mnt/alt")).unwrap();
        storage
            .mount(&ds("zfake/ROOT/alt"), Path::new("/mnt/alt"), "zfs")
            .unwrap();
        storage
            .mount(&ds("zfake/ROOT/alt/usr"), Path::new("/mnt/alt/usr"), "zfs")
            .unwrap();
        assert!(
            storage
                .mount(&ds("zfake/ROOT/alt"), Path::new("/mnt/elsewhere"), "zfs")
                .is_err()
        );
        assert_eq!(
            storage.mount_table().unwrap()["zfake/ROOT/alt/usr"],
            PathBuf::from("/mnt/alt/usr")
        );

        // Busy while mounted.
        assert!(storage.remove_directory(Path::new("/mnt/alt")).is_err());
        assert!(storage.unmount(Path::new("/mnt/alt"), false).is_err());

        storage.unmount(Path::new("/mnt/alt"), true).unwrap();
        assert!(!storage.mount_table().unwrap().contains_key("zfake/ROOT/alt"));
        storage.remove_directory(Path::new("/mnt/alt")).unwrap();
        assert!(!storage.directory_exists(Path::new("/mnt/alt")));

        assert!(storage.unmount(Path::new("/mnt/alt"), true).is_err());
    }

    #[test]
    fn test_emulated_faults_and_calls() {
        let storage = EmulatorStorage::sampled();
        storage.inject(Fault::MakeDirectory(PathBuf::from("/mnt/alt")));
        assert!(storage.make_directory(Path::new("/mnt/alt")).is_err());
        assert!(!storage.directory_exists(Path::new("/mnt/alt")));

        storage.clear_faults();
        storage.make_directory(Path::new("/mnt/alt")).unwrap();
        assert_eq!(
            storage.calls(),
            vec![
                Call::MakeDirectory(PathBuf::from("/mnt/alt")),
                Call::MakeDirectory(PathBuf::from("/mnt/alt")),
            ]
        );

        storage.clear_calls();
        assert!(storage.calls().is_empty());
    }

    #[test]
    fn test_emulated_pool_properties() {
        let storage = EmulatorStorage::sampled();
        assert_eq!(
            storage.pool_property("zfake", "bootfs").unwrap(),
            "zfake/ROOT/default"
        );
        assert_eq!(storage.pool_property("zfake", "comment").unwrap(), "-");
    }
}
