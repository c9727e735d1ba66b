//! Utility modules for the Specline server.

pub mod debounce;
