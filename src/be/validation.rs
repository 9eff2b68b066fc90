use super::Error;

/// The longest full dataset or snapshot name ZFS accepts.
pub(crate) const MAX_NAME_LEN: usize = 255;

/// Validates a boot environment name for ZFS dataset naming rules.
pub(crate) fn validate_be_name(be_name: &str, beroot: &str) -> Result<(), Error> {
    // Total length including beroot prefix + '/' must be under 256 chars.
    if beroot.len() + be_name.len() > 255 {
        return Err(Error::InvalidName {
            name: be_name.to_string(),
            reason: "name too long".to_string(),
        });
    }
    validate_component(be_name, true)
}

/// Validates a ZFS dataset name, optionally followed by `@snapshot`.
pub(crate) fn validate_dataset_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }
    let (dataset, snapshot) = match name.split_once('@') {
        Some((dataset, snapshot)) => (dataset, Some(snapshot)),
        None => (name, None),
    };
    let rename = |err: Error| match err {
        Error::InvalidName { reason, .. } => Error::InvalidName {
            name: name.to_string(),
            reason,
        },
        other => other,
    };
    for (i, comp) in dataset.split('/').enumerate() {
        if comp.is_empty() {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: if i == 0 {
                    "leading slash".to_string()
                } else {
                    "empty component".to_string()
                },
            });
        }
        validate_component(comp, true).map_err(rename)?;
    }
    if let Some(snapshot) = snapshot {
        validate_component(snapshot, false).map_err(rename)?;
    }
    Ok(())
}

/// Checks only the structure of a name reported by ZFS itself, which may use
/// characters (such as spaces) that boot environment names may not.
pub(crate) fn validate_reported_name(name: &str) -> Result<(), Error> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name too long"));
    }
    let (dataset, snapshot) = match name.split_once('@') {
        Some((dataset, snapshot)) => (dataset, Some(snapshot)),
        None => (name, None),
    };
    if dataset.split('/').any(str::is_empty) {
        return Err(invalid("empty component"));
    }
    match snapshot {
        Some("") => Err(invalid("empty snapshot name")),
        Some(snapshot) if snapshot.contains(['@', '/']) => {
            Err(invalid("invalid snapshot name"))
        }
        _ => Ok(()),
    }
}

/// Validates a ZFS component (i.e. part of a dataset or snapshot name).
pub(crate) fn validate_component(name: &str, is_dataset: bool) -> Result<(), Error> {
    // Boot environment names follow [A-Za-z0-9][A-Za-z0-9_:.-]*. ZFS itself
    // also permits spaces, which break too many boot loaders to allow here.

    if name.len() > 255 {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name too long".to_string(),
        });
    }

    let mut chars = name.chars();

    // Snapshots can begin with a non-alphanumeric character.
    match chars.next() {
        None => {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }
        Some(first) if is_dataset && !first.is_ascii_alphanumeric() => {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: format!("name cannot begin with '{}'", first),
            });
        }
        Some(first) if !is_component_char(first) => {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: format!("invalid character '{}' in name", first),
            });
        }
        Some(_) => {}
    }

    for c in chars {
        if !is_component_char(c) {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: format!("invalid character '{}' in name", c),
            });
        }
    }

    Ok(())
}

fn is_component_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == ':'
}
