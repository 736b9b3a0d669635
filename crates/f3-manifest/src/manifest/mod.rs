//! Manifest Model
//!
//! The F3 manifest document and the capability set the watcher needs from it.

pub mod cid;
pub mod types;

pub use cid::PowerTableCid;
pub use types::{EcConfig, GpbftConfig, Manifest, PowerEntry};

use crate::error::ManifestError;

/// What the watcher needs from a manifest: validation, equality against the
/// last applied version, and access to the initial power table identifier.
pub trait ManifestDocument: Clone + Send + Sync + 'static {
    /// Check the document is internally consistent.
    fn validate(&self) -> Result<(), ManifestError>;

    /// `false` when `other` is absent.
    fn equal(&self, other: Option<&Self>) -> bool;

    fn initial_power_table(&self) -> Option<&PowerTableCid>;

    fn set_initial_power_table(&mut self, cid: PowerTableCid);
}
