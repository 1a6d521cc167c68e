//! Persisted, resumable progress state.
//!
//! One manifest per archived source records every post seen and the terminal
//! outcome of each media item. The [`ManifestStore`] is the only writer.

mod error;
pub mod model;
mod store;

pub use error::ManifestError;
pub use model::{Checksum, Manifest, MediaItem, MediaSource, MediaType, Post, RetrievedFrom, Status};
pub use store::{
    DEFAULT_AUTOSAVE_EVERY, MANIFEST_FILE_NAME, ManifestStats, ManifestStore, temp_path,
};
