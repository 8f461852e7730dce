//! Core building blocks for the wl client runtime.
//!
//! This crate knows nothing about sockets or object tables. It provides the
//! wire codec, the identifier allocator and the listener lists that protocol
//! objects embed to fan events out to application code.

pub mod handler;
pub mod id_manager;
pub mod wire;
