// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use super::Error;
use super::validation::{
    MAX_NAME_LEN, validate_component, validate_dataset_name, validate_reported_name,
};

// Convenience type for already-validated ZFS dataset or snapshot names that
// can be handed straight to the storage layer as a command argument.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetName {
    inner: String,
}

impl DatasetName {
    pub fn new(name: &str) -> Result<Self, Error> {
        validate_dataset_name(name)?;
        Ok(Self {
            inner: name.to_string(),
        })
    }

    /// Accept a name as ZFS itself reported it, checking only its structure.
    pub fn reported(name: &str) -> Result<Self, Error> {
        validate_reported_name(name)?;
        Ok(Self {
            inner: name.to_string(),
        })
    }

    pub fn append(&self, child: &str) -> Result<Self, Error> {
        if self.is_snapshot() {
            return Err(Error::InvalidName {
                name: format!("{}/{}", self.inner, child),
                reason: "snapshots cannot have children".to_string(),
            });
        }
        validate_component(child, true)?;
        Self::within_limit(format!("{}/{}", self.inner, child))
    }

    pub fn snapshot(&self, name: &str) -> Result<Self, Error> {
        if self.is_snapshot() {
            return Err(Error::InvalidName {
                name: format!("{}@{}", self.inner, name),
                reason: "cannot snapshot a snapshot".to_string(),
            });
        }
        validate_component(name, false)?;
        Self::within_limit(format!("{}@{}", self.inner, name))
    }

    fn within_limit(inner: String) -> Result<Self, Error> {
        if inner.len() > MAX_NAME_LEN {
            return Err(Error::InvalidName {
                name: inner,
                reason: "name too long".to_string(),
            });
        }
        Ok(Self { inner })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_snapshot(&self) -> bool {
        self.inner.contains('@')
    }

    /// Get the pool name (the first component) for the dataset.
    pub fn pool(&self) -> &str {
        let end = self
            .inner
            .find(|c| c == '/' || c == '@')
            .unwrap_or(self.inner.len());
        &self.inner[..end]
    }

    /// Get the "basename" for the dataset, e.g. for `zfs/ROOT/be@snapshot`
    /// this is `be@snapshot`.
    pub fn basename(&self) -> &str {
        match self.inner.rfind('/') {
            Some(slash_pos) => &self.inner[slash_pos + 1..],
            None => &self.inner,
        }
    }

    /// Get the parent of this dataset.
    pub fn parent(&self) -> Option<DatasetName> {
        let index = self.inner.rfind('/')?;
        Some(Self {
            inner: self.inner[..index].to_string(),
        })
    }

    /// Re-root a dataset under `from` (or `from` itself) onto `to`, e.g.
    /// `zroot/ROOT/a/usr` from `zroot/ROOT/a` to `zroot/ROOT/b` is
    /// `zroot/ROOT/b/usr`. Returns `None` for datasets outside `from`.
    pub fn rebase(&self, from: &DatasetName, to: &DatasetName) -> Option<DatasetName> {
        let rest = self.inner.strip_prefix(from.as_str())?;
        if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('@')) {
            return None;
        }
        Some(Self {
            inner: format!("{}{}", to.as_str(), rest),
        })
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str) -> DatasetName {
        DatasetName::new(name).unwrap()
    }

    #[test]
    fn test_dataset_name_pool() {
        assert_eq!(ds("rpool/ROOT/default").pool(), "rpool");
        assert_eq!(ds("tank/data/projects").pool(), "tank");
        assert_eq!(ds("simple").pool(), "simple");
        assert_eq!(ds("simple@snap").pool(), "simple");
    }

    #[test]
    fn test_dataset_name_basename() {
        assert_eq!(ds("pool").basename(), "pool");
        assert_eq!(ds("rpool/ROOT/default").basename(), "default");
        assert_eq!(ds("rpool/ROOT/default@backup").basename(), "default@backup");
        assert_eq!(ds("simple@snap").basename(), "simple@snap");
    }

    #[test]
    fn test_dataset_name_append_and_snapshot() {
        let base = ds("pool");
        let child = base.append("data").unwrap();
        assert_eq!(child.as_str(), "pool/data");

        let grandchild = child.append("projects").unwrap();
        assert_eq!(grandchild.as_str(), "pool/data/projects");

        let snap = base.snapshot("backup").unwrap();
        assert_eq!(snap.as_str(), "pool@backup");
        assert!(snap.is_snapshot());

        let child_snap = grandchild.snapshot("2023-12-01").unwrap();
        assert_eq!(child_snap.as_str(), "pool/data/projects@2023-12-01");

        // Cannot append to, or snapshot, a snapshot.
        let snapshot = ds("pool/dataset@snap");
        assert!(snapshot.append("child").is_err());
        assert!(snapshot.snapshot("another").is_err());

        assert!(base.append("").is_err()); // empty component
        assert!(base.append("invalid name").is_err()); // space in name
        assert!(base.append("a/b").is_err()); // more than one component
        assert!(base.snapshot("").is_err()); // empty snapshot name
        assert!(base.snapshot("invalid name").is_err()); // space in snapshot name
    }

    #[test]
    fn test_dataset_name_reported() {
        let reported = DatasetName::reported("rpool/ROOT/default/my data").unwrap();
        assert_eq!(reported.basename(), "my data");
        assert_eq!(
            reported.snapshot("beadm-clone-default-to-next").unwrap().as_str(),
            "rpool/ROOT/default/my data@beadm-clone-default-to-next"
        );
        assert!(DatasetName::new("rpool/ROOT/default/my data").is_err());
        assert!(DatasetName::reported("rpool//data").is_err());
    }

    #[test]
    fn test_dataset_name_length_limit() {
        let base = ds(&format!("pool/{}", "a".repeat(240)));
        assert!(base.snapshot(&"s".repeat(9)).is_ok());
        // Each part is fine on its own, but the whole name is too long.
        assert!(matches!(
            base.snapshot(&"s".repeat(20)),
            Err(Error::InvalidName { reason, .. }) if reason == "name too long"
        ));
        assert!(base.append(&"c".repeat(20)).is_err());
    }

    #[test]
    fn test_dataset_parent() {
        assert_eq!(ds("rpool").parent(), None);
        assert_eq!(ds("rpool/ROOT/default").parent(), Some(ds("rpool/ROOT")));
        assert_eq!(
            ds("rpool/ROOT/default@backup").parent(),
            Some(ds("rpool/ROOT"))
        );
    }

    #[test]
    fn test_dataset_rebase() {
        let from = ds("zroot/ROOT/default");
        let to = ds("zroot/ROOT/next");
        assert_eq!(ds("zroot/ROOT/default").rebase(&from, &to), Some(to.clone()));
        assert_eq!(
            ds("zroot/ROOT/default/usr/local").rebase(&from, &to),
            Some(ds("zroot/ROOT/next/usr/local"))
        );
        assert_eq!(
            ds("zroot/ROOT/default@snap").rebase(&from, &to),
            Some(ds("zroot/ROOT/next@snap"))
        );
        // A sibling sharing a prefix is not beneath the source.
        assert_eq!(ds("zroot/ROOT/default2").rebase(&from, &to), None);
        assert_eq!(ds("zroot/home").rebase(&from, &to), None);
    }
}
