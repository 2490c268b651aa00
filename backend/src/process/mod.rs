//! Supervision of external tool processes
//!
//! Every child process the application starts goes through the
//! [`ProcessSupervisor`]. Callers get a [`ProcessHandle`] and a
//! [`ProcessOutput`] stream; only the supervisor ever touches the OS-level
//! child or sends it signals.

mod signal;
mod supervisor;

pub use supervisor::*;
