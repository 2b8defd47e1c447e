//! Image manifest model and platform resolution

pub mod manifest;

pub use manifest::{
    ImageManifest, IndexEntry, ManifestIndex, ManifestKind, Platform, MANIFEST_ACCEPT,
};
