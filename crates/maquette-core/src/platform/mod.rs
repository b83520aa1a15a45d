//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than
//! scattered through the lifecycle code. The only concern the bridge needs
//! is process management: aliveness checks for lock-record validation and
//! termination for forced stops.

pub mod process;

pub use process::{is_process_alive, terminate_process};
