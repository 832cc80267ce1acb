//! Time-boxed invitations offered to providers.

pub mod transitions;
pub mod types;

pub use types::*;
