// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::validation::validate_be_name;
use super::{DatasetKind, DatasetName, Error, Storage};

/// The component that marks the parent of all boot environments.
const BE_ROOT_MARKER: &str = "ROOT";

/// Pool property naming the filesystem the boot loader uses next.
pub const BOOTFS_PROP: &str = "bootfs";

/// Facts about the running system's boot environment layout, established once
/// at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    be_root: DatasetName,
    pool: String,
    current: String,
    current_dataset: DatasetName,
}

impl Context {
    /// Derive the context from the dataset mounted at `/`, which must look
    /// like `<pool>[/...]/ROOT/<name>`.
    pub fn from_root_dataset(rootfs: &DatasetName) -> Result<Self, Error> {
        if rootfs.is_snapshot() {
            return Err(Error::NoActiveBootEnvironment);
        }
        let be_root = rootfs.parent().ok_or(Error::NoActiveBootEnvironment)?;
        let has_marker = be_root
            .as_str()
            .rsplit_once('/')
            .is_some_and(|(_, last)| last == BE_ROOT_MARKER);
        if !has_marker {
            return Err(Error::NoActiveBootEnvironment);
        }
        Ok(Self {
            pool: rootfs.pool().to_string(),
            current: rootfs.basename().to_string(),
            current_dataset: rootfs.clone(),
            be_root,
        })
    }

    /// Derive the context from the live root filesystem.
    pub fn detect<S: Storage + ?Sized>(storage: &S) -> Result<Self, Error> {
        Self::from_root_dataset(&storage.root_dataset()?)
    }

    pub fn be_root(&self) -> &DatasetName {
        &self.be_root
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    /// The dataset backing the running boot environment.
    pub fn current_dataset(&self) -> &DatasetName {
        &self.current_dataset
    }

    /// The dataset for the boot environment `be_name`, rejecting names that
    /// are not a single valid component.
    pub fn be_dataset(&self, be_name: &str) -> Result<DatasetName, Error> {
        validate_be_name(be_name, self.be_root.as_str())?;
        self.be_root.append(be_name)
    }

    /// The boot environment name for a dataset exactly one level below the
    /// boot environment root.
    pub fn be_name_of<'a>(&self, dataset: &'a str) -> Option<&'a str> {
        let name = dataset
            .strip_prefix(self.be_root.as_str())?
            .strip_prefix('/')?;
        if name.is_empty() || name.contains('/') || name.contains('@') {
            None
        } else {
            Some(name)
        }
    }
}

/// Read-only queries about the boot environments under a context's root.
pub struct Registry<'a, S: Storage + ?Sized> {
    storage: &'a S,
    context: &'a Context,
}

impl<'a, S: Storage + ?Sized> Registry<'a, S> {
    pub fn new(storage: &'a S, context: &'a Context) -> Self {
        Self { storage, context }
    }

    /// Names of all boot environments, in storage listing order.
    pub fn list(&self) -> Result<Vec<String>, Error> {
        let datasets = self
            .storage
            .list_datasets(self.context.be_root(), DatasetKind::Filesystem)?;
        Ok(datasets
            .iter()
            .filter_map(|dataset| self.context.be_name_of(dataset))
            .map(str::to_string)
            .collect())
    }

    pub fn exists(&self, be_name: &str) -> Result<bool, Error> {
        Ok(self.list()?.iter().any(|name| name == be_name))
    }

    /// The boot environment backing the running system.
    pub fn current(&self) -> &'a str {
        self.context.current()
    }

    /// The boot environment the boot loader will use next.
    pub fn active(&self) -> Result<String, Error> {
        let value = self
            .storage
            .pool_property(self.context.pool(), BOOTFS_PROP)?;
        let value = value.trim();
        match self.context.be_name_of(value) {
            Some(name) => Ok(name.to_string()),
            None => Err(Error::InvalidBootfs {
                value: value.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::mock::EmulatorStorage;

    fn ds(name: &str) -> DatasetName {
        DatasetName::new(name).unwrap()
    }

    #[test]
    fn test_context_from_root_dataset() {
        let context = Context::from_root_dataset(&ds("zroot/ROOT/default")).unwrap();
        assert_eq!(context.be_root().as_str(), "zroot/ROOT");
        assert_eq!(context.pool(), "zroot");
        assert_eq!(context.current(), "default");
        assert_eq!(context.current_dataset(), &ds("zroot/ROOT/default"));

        // Nested boot environment roots are fine as long as they end in ROOT.
        let context = Context::from_root_dataset(&ds("tank/sys/host1/ROOT/be1")).unwrap();
        assert_eq!(context.be_root().as_str(), "tank/sys/host1/ROOT");
        assert_eq!(context.pool(), "tank");
        assert_eq!(context.current(), "be1");
    }

    #[test]
    fn test_context_rejects_other_layouts() {
        for rootfs in [
            "zroot",
            "ROOT/default",
            "zroot/default",
            "zroot/ROOT",
            "zroot/ROOTS/default",
            "zroot/ROOT/default/usr",
            "zroot/ROOT/default@snap",
        ] {
            assert!(
                matches!(
                    Context::from_root_dataset(&ds(rootfs)),
                    Err(Error::NoActiveBootEnvironment)
                ),
                "{} should not be a boot environment",
                rootfs
            );
        }
    }

    #[test]
    fn test_context_be_dataset() {
        let context = Context::from_root_dataset(&ds("zroot/ROOT/default")).unwrap();
        assert_eq!(context.be_dataset("alt").unwrap(), ds("zroot/ROOT/alt"));
        assert!(matches!(
            context.be_dataset("../home"),
            Err(Error::InvalidName { .. })
        ));
        assert!(context.be_dataset("alt/usr").is_err());
        assert!(context.be_dataset("").is_err());
    }

    #[test]
    fn test_context_be_name_of() {
        let context = Context::from_root_dataset(&ds("zroot/ROOT/default")).unwrap();
        assert_eq!(context.be_name_of("zroot/ROOT/alt"), Some("alt"));
        assert_eq!(context.be_name_of("zroot/ROOT"), None);
        assert_eq!(context.be_name_of("zroot/ROOT/"), None);
        assert_eq!(context.be_name_of("zroot/ROOT/alt/usr"), None);
        assert_eq!(context.be_name_of("zroot/ROOT/alt@snap"), None);
        assert_eq!(context.be_name_of("zroot/ROOTS/alt"), None);
        assert_eq!(context.be_name_of("zroot/home"), None);
    }

    #[test]
    fn test_context_detect() {
        let storage = EmulatorStorage::sampled();
        let context = Context::detect(&storage).unwrap();
        assert_eq!(context.be_root().as_str(), "zfake/ROOT");
        assert_eq!(context.current(), "default");
    }

    #[test]
    fn test_registry_list() {
        let storage = EmulatorStorage::sampled();
        let context = Context::detect(&storage).unwrap();
        let registry = Registry::new(&storage, &context);
        // Nested datasets such as default/usr are not boot environments.
        assert_eq!(registry.list().unwrap(), vec!["alt", "default"]);
        assert!(registry.exists("alt").unwrap());
        assert!(!registry.exists("usr").unwrap());
    }

    #[test]
    fn test_registry_current_and_active() {
        let storage = EmulatorStorage::sampled();
        let context = Context::detect(&storage).unwrap();
        let registry = Registry::new(&storage, &context);
        assert_eq!(registry.current(), "default");
        assert_eq!(registry.active().unwrap(), "default");

        storage
            .set_pool_property("zfake", BOOTFS_PROP, "zfake/ROOT/alt")
            .unwrap();
        assert_eq!(registry.active().unwrap(), "alt");
        // The running boot environment does not follow bootfs.
        assert_eq!(registry.current(), "default");
    }

    #[test]
    fn test_registry_active_rejects_foreign_bootfs() {
        let storage = EmulatorStorage::sampled();
        let context = Context::detect(&storage).unwrap();
        let registry = Registry::new(&storage, &context);
        for value in ["-", "zfake/home", "zfake/ROOT", "zfake/ROOT/default/usr"] {
            storage
                .set_pool_property("zfake", BOOTFS_PROP, value)
                .unwrap();
            assert!(matches!(
                registry.active(),
                Err(Error::InvalidBootfs { value: v }) if v == value
            ));
        }
    }
}
