//! Durable state shared by discovery and sweeping: the confirmed-endpoint history and the
//! playlist catalog.

mod catalog;
mod error;
mod history;
mod rotation;

pub use catalog::{Artifact, ArtifactKey, Catalog, CatalogEntry, ARTIFACT_EXTENSION};
pub use error::{Result, StoreError};
pub use history::{HistoryRecord, HistoryStore, HISTORY_FILE};
pub use rotation::RotationPeriod;
