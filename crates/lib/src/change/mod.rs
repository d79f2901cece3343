//! Change tracking across resolves.
//!
//! Scripts report every property they read; the snapshots recorded here
//! are compared against the next resolved model to decide which
//! transformers must re-run their prepare step or their commands.

mod property;
mod requested;
mod tracker;

pub use property::{Property, PropertyKind, PropertyReads};
pub use requested::{ArtifactsByTag, RequestedArtifacts, RequestedDependencies};
pub use tracker::{ChangeTracker, Decision};
