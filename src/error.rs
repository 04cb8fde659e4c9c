// Copyright (c) 2025 RustyDB Contributors
//
// Error type for the tag store and its concurrency primitives.
//
// `InvariantViolation` is raised via `panic!` rather than through this enum:
// it signals a broken internal contract (e.g. the map finding no free slot
// despite the load-factor invariant), which has no recovery path. The
// variants here are the subset of failures that are expected to reach a
// caller as an ordinary `Result::Err`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagStoreError {
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("usage error: {0}")]
    UsageError(String),

    #[error("compute counter overflow (>= 2^29 concurrent getters)")]
    ComputeCounterOverflow,

    #[error("map variant mismatch: expected {expected}, found {found}")]
    VariantMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, TagStoreError>;
