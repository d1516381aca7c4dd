//! Non-fatal conditions reported back to the caller.
//!
//! A warning never aborts an operation. Every warning is also emitted through
//! `log::warn!` at the point where it is raised, so callers that only care
//! about the log can ignore the returned list.

/// A condition the operator should know about that did not stop the operation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    #[error("{skipped} point match(es) skipped: both a 2D and a 3D point are required")]
    IncompleteCorrespondences { skipped: usize },
    #[error("distortion model {model} is not supported, using zero distortion")]
    UnsupportedDistortionModel { model: String },
}
