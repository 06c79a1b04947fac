//! Error types for the settler
//!
//! Uses `eyre` for ergonomic error handling with context. Failures inside a
//! single tick or a single outcome check are logged where they happen; only
//! startup failures travel all the way back to the binary.

pub use eyre::{bail, eyre, Context, Report, Result};
