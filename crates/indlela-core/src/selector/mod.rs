//! Runtime selector.
//!
//! Resolves a manifest item against the host into a concrete backend,
//! provider, and resource parameters, with a reproducible downgrade ladder
//! and a full audit trail.

mod capability;
mod engine;
mod report;

pub use capability::HostCapabilities;
pub use engine::Selector;
pub use report::{
    Candidate, Decision, DowngradeDimension, DowngradeStep, SelectedRuntime, SelectionHints,
    SelectionReport,
};
