//! Plumbing shared by commands.

pub mod context;
pub mod error;

pub use context::Context;
pub use error::BatchFailed;
