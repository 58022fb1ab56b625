//! Shared test infrastructure.

/// Channel pairs, raw peers and polling helpers.
pub mod harness;
/// Test doubles for device collaborators.
pub mod mocks;
