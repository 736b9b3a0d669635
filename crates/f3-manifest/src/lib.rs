//! F3 manifest distribution
//!
//! Polls the finality manifest from an authoritative source, validates it and
//! publishes each distinct version exactly once to a subscriber.

pub mod config;
pub mod error;
pub mod manifest;
pub mod source;
pub mod watcher;

pub use config::WatcherConfig;
pub use error::{ConfigError, ManifestError, SourceError, WatcherError};
pub use manifest::{EcConfig, GpbftConfig, Manifest, ManifestDocument, PowerEntry, PowerTableCid};
pub use source::{ManifestSource, RpcManifestSource};
pub use watcher::{ManifestUpdates, ManifestWatcher};
