//! Worker process management
//!
//! Only Unix is supported: workers run in their own process group so a
//! cancellation reaches everything they forked.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
