//! Retention policy and evaluator
//!
//! Decides which snapshots survive a prune. The evaluator is a pure
//! function over literal snapshot lists; the orchestrator applies its
//! decision through engine forget calls.

mod evaluator;
mod policy;

pub use evaluator::{RetentionDecision, evaluate};
pub use policy::{PolicyError, RetentionPolicy};
