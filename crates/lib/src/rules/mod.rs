//! The rule engine.
//!
//! Rules are ordered by the tags they produce and consume, then fired one
//! after another so each rule sees every artifact its predecessors created.

mod apply;
mod order;
pub mod template;

pub use apply::{ApplyOutcome, ApplyStats, RuleApplicator};
pub use order::order_rules;
