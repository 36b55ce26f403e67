//! AutifyME CLI: operator tooling over the autifyme-core engine.
//!
//! The binary in `main.rs` only parses arguments; everything it runs lives
//! here so integration tests can call the same code paths.

pub mod commands;
pub mod executor;
