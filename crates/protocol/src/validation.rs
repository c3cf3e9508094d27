//! Placement checks for paths on the archive side.
//!
//! A file lands at `<endpoint>/<remote root>/<unit path>`. Both parts are
//! relative and may not climb out of the part before them.

use std::path::{Component, Path};

use crate::ManifestError;

/// Checks a unit's remote relative path. It must name a file below the
/// destination's remote root.
pub fn validate_unit_path(path: &str) -> Result<(), ManifestError> {
    let reject = |reason| ManifestError::InvalidUnitPath {
        path: path.to_string(),
        reason,
    };
    if path.is_empty() {
        return Err(reject("is empty"));
    }
    if let Some(reason) = escape_reason(path) {
        return Err(reject(reason));
    }
    if !Path::new(path)
        .components()
        .any(|c| matches!(c, Component::Normal(_)))
    {
        return Err(reject("names the remote root, not a file"));
    }
    Ok(())
}

/// Checks a destination's remote root, a directory below the archive
/// endpoint. Empty means the endpoint itself.
pub fn validate_remote_root(root: &str) -> Result<(), ManifestError> {
    match escape_reason(root) {
        Some(reason) => Err(ManifestError::InvalidRemoteRoot {
            root: root.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn escape_reason(path: &str) -> Option<&'static str> {
    let path = Path::new(path);
    if path.is_absolute() {
        return Some("is absolute");
    }
    path.components().find_map(|c| match c {
        Component::ParentDir => Some("climbs out through `..`"),
        Component::Prefix(_) | Component::RootDir => Some("is absolute"),
        Component::CurDir | Component::Normal(_) => None,
    })
}
