//! The method-patch engine
//!
//! [`spec::parse`] turns the textual spec into requests, [`locator::find`]
//! resolves each against the decoded container, [`BodyRewriter`] swaps in
//! the canned body and [`Patcher`] drives the whole run.

pub mod locator;
pub mod orchestrator;
pub mod rewriter;
pub mod spec;

pub use orchestrator::{PatchError, PatchOptions, PatchRun, Patcher};
pub use rewriter::BodyRewriter;
pub use spec::SpecError;
