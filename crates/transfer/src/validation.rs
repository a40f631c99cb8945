use std::path::{Component, Path};

use blobferry_model::BlobRef;

use crate::TransferError;

/// Validates that a blob reference maps to a path inside a store root.
///
/// The container must be a single plain component. The blob name may contain
/// `/` separators but must stay relative: no empty name, no absolute path,
/// no `..` and no Windows prefix.
pub fn validate_blob_ref(blob: &BlobRef) -> Result<(), TransferError> {
    let container = Path::new(&blob.container);
    let mut components = container.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => {
            return Err(TransferError::InvalidPath(format!(
                "invalid container name: {}",
                blob.container
            )));
        }
    }
    validate_relative_path(&blob.name)
}

fn validate_relative_path(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty blob name".into()));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {name}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {name}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
