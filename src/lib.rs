//! Scriptbox: run Python programs in an interruptible sandbox
//!
//! Programs are instrumented so that `input()`, `time.sleep()` and plot
//! display yield to the host, executed in a worker sandbox (or the host
//! runtime as a fallback), and stopped cooperatively or by termination
//! when they exceed their budget or the user cancels them.
//!
//! This crate re-exports [`scriptbox_core`]; see [`Session`] for the
//! entry point.

pub use scriptbox_core::*;
