//! # Configuration
//!
//! Operator configuration from environment variables. Process-level flags
//! (listen addresses, leader election, debug) are parsed by `clap` in
//! `main.rs`, see [`crate::runtime::Args`].

mod controller;

pub use controller::ControllerConfig;
