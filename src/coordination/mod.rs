//! Process-wide coordination: the shutdown signal and drain sequencing.

pub mod shutdown;

pub use shutdown::{wait_for_signal, Shutdown};
