//! Web-archive fallback for media the source no longer serves.
//!
//! # Example
//!
//! ```no_run
//! use archiver_core::archive::{ArchiveClient, ArchiveSettings};
//! use archiver_core::fetch::{FetchClient, FetchSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetch = FetchClient::from_settings(&FetchSettings::default())?;
//! let archive = ArchiveClient::new(fetch, ArchiveSettings::default());
//! match archive.find_best("https://media.example.com/a_1280.jpg").await? {
//!     Some(snapshot) => println!("replay from {}", snapshot.replay_url),
//!     None => println!("never captured"),
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod matching;
mod snapshot;

pub use client::{ArchiveClient, ArchiveSettings, DEFAULT_CDX_ENDPOINT, DEFAULT_REPLAY_BASE};
pub use error::ArchiveError;
pub use snapshot::{
    DEFAULT_RECENCY_START_YEAR, SelectorConfig, Snapshot, replay_url, score, select_best,
};
