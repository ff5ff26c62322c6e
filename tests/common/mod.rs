//! Common test utilities for integration tests.

pub mod assertions;
pub mod backend;
pub mod fixtures;

// Re-export common types
pub use assertions::*;
pub use backend::*;
pub use fixtures::*;
