//! Playlist endpoint validation and hit labelling.

pub mod classify;
pub mod probe;

pub use classify::{sanitize_label, LabelRule};
pub use probe::{EndpointProbe, ProbeOptions, ProbeOutcome, RequestShape, Signature, DEFAULT_PROBE_URL};
