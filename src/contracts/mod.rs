//! Contract bindings for the settlement contract

pub mod tenant_manager;

pub use tenant_manager::*;
