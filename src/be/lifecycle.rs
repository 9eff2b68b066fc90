// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use super::registry::{BOOTFS_PROP, Context, Registry};
use super::{
    CloneOptions, DatasetKind, DatasetName, DestroyMode, Error, Outcome, Storage, is_lineage_of,
    lineage_tag, staged_mountpoint, staging_dir,
};

/// Datasets paired with where they are mounted when staged.
type StagedMounts = Vec<(DatasetName, PathBuf)>;

/// Performs boot environment lifecycle operations against a storage backend.
///
/// Every operation either returns an [`Outcome`] (with `Rejected` meaning a
/// precondition failed and nothing was touched) or a fatal [`Error`] once
/// storage may have been left partially modified.
pub struct Manager<S: Storage> {
    storage: S,
    context: Context,
}

impl<S: Storage> Manager<S> {
    pub fn new(storage: S, context: Context) -> Self {
        Self { storage, context }
    }

    /// Build a manager for the boot environment the system is running.
    pub fn open(storage: S) -> Result<Self, Error> {
        let context = Context::detect(&storage)?;
        tracing::debug!(
            be_root = %context.be_root(),
            current = context.current(),
            "detected boot environment layout"
        );
        Ok(Self::new(storage, context))
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn registry(&self) -> Registry<'_, S> {
        Registry::new(&self.storage, &self.context)
    }

    /// Create boot environment `be_name` by cloning the running one.
    pub fn create(&self, be_name: &str) -> Result<Outcome, Error> {
        let target = match self.context.be_dataset(be_name) {
            Ok(target) => target,
            Err(err) => return Ok(reject(err)),
        };
        if self.registry().exists(be_name)? {
            return Ok(reject(Error::conflict(be_name)));
        }

        let source = self.context.current_dataset();
        let tag = lineage_tag(self.context.current(), be_name);
        let snapshot = match source.snapshot(&tag) {
            Ok(snapshot) => snapshot,
            Err(err) => return Ok(reject(err)),
        };

        tracing::info!(snapshot = %snapshot, "creating snapshots for cloning");
        if let Err(err) = self.storage.snapshot(&snapshot, true) {
            tracing::error!(snapshot = %snapshot, "failed to snapshot: {}", err);
            return Err(Error::fatal("Failed to create snapshots for cloning"));
        }

        if let Err(err) = self.clone_tree(source, &target, &tag) {
            tracing::error!(dataset = %target, "failed to clone: {}", err);
            // Destroying the snapshot with its dependents takes any clones
            // already made along with it.
            if let Err(err) = self.storage.destroy(&snapshot, DestroyMode::Dependents) {
                tracing::warn!(snapshot = %snapshot, "rollback failed: {}", err);
            }
            return Err(Error::needs_cleanup("Failed to clone snapshot"));
        }

        tracing::info!(name = be_name, "created boot environment");
        Ok(Outcome::Applied)
    }

    fn clone_tree(
        &self,
        source: &DatasetName,
        target: &DatasetName,
        tag: &str,
    ) -> Result<(), Error> {
        for record in self.storage.list_filesystems(source)? {
            let dataset = DatasetName::reported(&record.dataset)?;
            let clone = dataset.rebase(source, target).ok_or_else(|| {
                Error::fatal(format!("'{}' is not part of '{}'", dataset, source))
            })?;
            let origin = dataset.snapshot(tag)?;
            tracing::debug!(origin = %origin, clone = %clone, "cloning");
            self.storage
                .clone_snapshot(&origin, &clone, &CloneOptions::inert(record.mountpoint))?;
        }
        Ok(())
    }

    /// Destroy boot environment `be_name` along with its lineage snapshots
    /// and staging directory.
    pub fn destroy(&self, be_name: &str) -> Result<Outcome, Error> {
        let dataset = match self.context.be_dataset(be_name) {
            Ok(dataset) => dataset,
            Err(err) => return Ok(reject(err)),
        };
        if be_name == self.context.current() {
            return Ok(reject(Error::CannotDestroyCurrent {
                name: be_name.to_string(),
            }));
        }
        if !self.storage.dataset_exists(&dataset)? {
            return Ok(reject(Error::not_found(be_name)));
        }

        if let Err(err) = self.storage.destroy(&dataset, DestroyMode::Recursive) {
            tracing::error!(dataset = %dataset, "failed to destroy: {}", err);
            return Err(Error::needs_cleanup("Failed to destroy the boot environment"));
        }

        let snapshots = self
            .storage
            .list_datasets(self.context.be_root(), DatasetKind::Snapshot)
            .map_err(|err| {
                tracing::error!("failed to list snapshots: {}", err);
                Error::needs_cleanup("Failed to list lineage snapshots")
            })?;
        for snapshot in snapshots
            .iter()
            .filter(|snapshot| is_lineage_of(snapshot, be_name))
        {
            let snapshot = DatasetName::reported(snapshot).map_err(|err| {
                tracing::error!("unusable snapshot name: {}", err);
                Error::needs_cleanup(&format!("Failed to destroy snapshot '{}'", snapshot))
            })?;
            tracing::debug!(snapshot = %snapshot, "destroying lineage snapshot");
            if let Err(err) = self.storage.destroy(&snapshot, DestroyMode::Single) {
                tracing::error!(snapshot = %snapshot, "failed to destroy: {}", err);
                return Err(Error::needs_cleanup(&format!(
                    "Failed to destroy snapshot '{}'",
                    snapshot
                )));
            }
        }

        let staging = staging_dir(be_name);
        if self.storage.directory_exists(&staging) {
            if let Err(err) = self.storage.remove_directory(&staging) {
                tracing::warn!(path = %staging.display(), "could not remove: {}", err);
            }
        }

        tracing::info!(name = be_name, "destroyed boot environment");
        Ok(Outcome::Applied)
    }

    /// The datasets of a boot environment paired with where they are mounted
    /// when staged, in listing order. Datasets without a mountpoint path are
    /// left out.
    fn expected_mounts(
        &self,
        be_name: &str,
        dataset: &DatasetName,
    ) -> Result<StagedMounts, Error> {
        let mut expected = Vec::new();
        for record in self.storage.list_filesystems(dataset)? {
            match staged_mountpoint(be_name, &record.mountpoint) {
                Some(path) => {
                    expected.push((DatasetName::reported(&record.dataset)?, path));
                }
                None => tracing::debug!(
                    dataset = %record.dataset,
                    mountpoint = %record.mountpoint,
                    "not staging"
                ),
            }
        }
        Ok(expected)
    }

    /// Validate `be_name` and collect its staged mounts, or say why not.
    fn staged_mounts(&self, be_name: &str) -> Result<Result<StagedMounts, Error>, Error> {
        let dataset = match self.context.be_dataset(be_name) {
            Ok(dataset) => dataset,
            Err(err) => return Ok(Err(err)),
        };
        if !self.storage.dataset_exists(&dataset)? {
            return Ok(Err(Error::not_found(be_name)));
        }
        let expected = self.expected_mounts(be_name, &dataset)?;
        if expected.is_empty() {
            return Ok(Err(Error::not_found(be_name)));
        }
        Ok(Ok(expected))
    }

    /// Mount every dataset of boot environment `be_name` under its staging
    /// directory.
    pub fn mount(&self, be_name: &str) -> Result<Outcome, Error> {
        let expected = match self.staged_mounts(be_name)? {
            Ok(expected) => expected,
            Err(err) => return Ok(reject(err)),
        };

        let table = self.storage.mount_table()?;
        let mounted_here = |(dataset, path): &(DatasetName, PathBuf)| {
            table.get(dataset.as_str()) == Some(path)
        };
        if expected.iter().all(mounted_here) {
            tracing::warn!(name = be_name, "boot environment is already mounted");
            return Ok(Outcome::Unchanged);
        }
        if expected
            .iter()
            .any(|(dataset, _)| table.contains_key(dataset.as_str()))
        {
            return Ok(reject(Error::already_mounted(be_name)));
        }

        let staging = staging_dir(be_name);
        if !self.storage.directory_exists(&staging) {
            if let Err(err) = self.storage.make_directory(&staging) {
                tracing::error!(path = %staging.display(), "failed to create: {}", err);
                return Err(Error::fatal(format!(
                    "Failed to create mountpoint '{}'",
                    staging.display()
                )));
            }
        }

        for (dataset, path) in &expected {
            tracing::debug!(dataset = %dataset, path = %path.display(), "mounting");
            if let Err(err) = self.storage.mount(dataset, path, "zfs") {
                tracing::error!(dataset = %dataset, "failed to mount: {}", err);
                self.unwind_mount(&staging);
                return Err(Error::needs_cleanup(&format!(
                    "Failed to mount '{}'",
                    dataset
                )));
            }
        }

        tracing::info!(name = be_name, path = %staging.display(), "mounted boot environment");
        Ok(Outcome::Applied)
    }

    fn unwind_mount(&self, staging: &Path) {
        if let Err(err) = self.storage.unmount(staging, true) {
            tracing::warn!(path = %staging.display(), "could not unmount: {}", err);
        }
        if let Err(err) = self.storage.remove_directory(staging) {
            tracing::warn!(path = %staging.display(), "could not remove: {}", err);
        }
    }

    /// Unmount boot environment `be_name` from its staging directory and
    /// remove the directory.
    pub fn unmount(&self, be_name: &str) -> Result<Outcome, Error> {
        let expected = match self.staged_mounts(be_name)? {
            Ok(expected) => expected,
            Err(err) => return Ok(reject(err)),
        };

        let table = self.storage.mount_table()?;
        if !expected
            .iter()
            .any(|(dataset, _)| table.contains_key(dataset.as_str()))
        {
            tracing::warn!(name = be_name, "boot environment is not mounted");
            return Ok(Outcome::Unchanged);
        }

        let staging = staging_dir(be_name);
        if let Err(err) = self.storage.unmount(&staging, true) {
            tracing::error!(path = %staging.display(), "failed to unmount: {}", err);
            return Ok(reject(Error::busy(be_name)));
        }
        if let Err(err) = self.storage.remove_directory(&staging) {
            tracing::error!(path = %staging.display(), "failed to remove: {}", err);
            return Ok(reject(Error::busy(be_name)));
        }

        tracing::info!(name = be_name, "unmounted boot environment");
        Ok(Outcome::Applied)
    }

    /// Make boot environment `be_name` the one the pool boots next.
    pub fn activate(&self, be_name: &str) -> Result<Outcome, Error> {
        let dataset = match self.context.be_dataset(be_name) {
            Ok(dataset) => dataset,
            Err(err) => return Ok(reject(err)),
        };
        if !self.storage.dataset_exists(&dataset)? {
            return Ok(reject(Error::not_found(be_name)));
        }

        let pool = self.context.pool();
        let bootfs = self.storage.pool_property(pool, BOOTFS_PROP)?;
        if bootfs.trim() == dataset.as_str() {
            tracing::warn!(name = be_name, "boot environment is already active");
            return Ok(Outcome::Unchanged);
        }

        if let Err(err) = self
            .storage
            .set_pool_property(pool, BOOTFS_PROP, dataset.as_str())
        {
            tracing::error!(pool, "failed to set {}: {}", BOOTFS_PROP, err);
            return Err(Error::fatal(format!(
                "Failed to activate boot environment '{}'",
                be_name
            )));
        }

        tracing::info!(name = be_name, "activated boot environment");
        Ok(Outcome::Applied)
    }
}

fn reject(err: Error) -> Outcome {
    tracing::error!("{}", err);
    Outcome::Rejected(err)
}
