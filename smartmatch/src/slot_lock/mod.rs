//! Per-provider time slot reservations.

pub mod transitions;
pub mod types;

pub use transitions::{LockRequest, release_lock, sweep_expired};
pub use types::*;
