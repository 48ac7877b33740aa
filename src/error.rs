//! Error taxonomy for the response cache.
//!
//! Handle construction errors are programming defects in the collaborator
//! building the tag set and reject construction outright. Protocol errors
//! report misuse of the start/end response lifecycle. Cache-internal
//! failures never surface here; the engine degrades to a miss instead.

use thiserror::Error;

use crate::tag::IncomparableTags;

/// Rejection of a malformed primary tag set during handle construction.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("primary tag set must not be empty")]
    EmptyTagSet,
    #[error("wildcard tag '{0}' not allowed as primary tag")]
    WildcardPrimaryTag(String),
    #[error("duplicate primary tag '{0}'")]
    DuplicatePrimaryTag(String),
    #[error(transparent)]
    Incomparable(#[from] IncomparableTags),
}

/// Misuse of the cacheable response lifecycle.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("response already has an active cache transaction")]
    AlreadyStarted,
    #[error("no active cacheable response")]
    NoActiveResponse,
    #[error("no active response part")]
    NoActivePart,
    #[error("response parts are still open")]
    PartsStillOpen,
    #[error("handle does not identify the active response part")]
    HandleMismatch,
}
