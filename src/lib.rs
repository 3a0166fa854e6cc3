//! autochroot library exports.
//!
//! Exposes the pipeline stages for integration testing; the binary in
//! `main.rs` is a thin CLI over [`engine::run`].

pub mod config;
pub mod engine;
pub mod error;
pub mod fstab;
pub mod inventory;
pub mod plan;
pub mod process;
pub mod resolve;
pub mod safety;
pub mod script;
