// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no memory type matches type bits {type_bits:#x} with properties {required:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("device allocation failed: {0}")]
    Device(#[from] vk::Result),
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("unsupported asset format `{extension}` ({path})")]
    UnsupportedFormat { path: PathBuf, extension: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("gpu upload of {path} failed: {reason}")]
    Upload { path: PathBuf, reason: String },
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl AssetError {
    /// Errors that abort the whole load batch instead of degrading one asset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AssetError::UnsupportedFormat { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("object type `{0}` has no registered mesh")]
    UnknownObjectType(String),
    #[error("scene has {count} objects but the per-object buffer holds {capacity}")]
    ObjectCapacity { count: usize, capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unsupported_format_is_fatal() {
        let unsupported = AssetError::UnsupportedFormat {
            path: "a.fbx".into(),
            extension: "fbx".into(),
        };
        let missing = AssetError::Io {
            path: "a.obj".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(unsupported.is_fatal());
        assert!(!missing.is_fatal());
        assert!(!AssetError::Panicked("boom".into()).is_fatal());
    }
}
