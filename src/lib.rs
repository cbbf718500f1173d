//! NIM Operator Library
//!
//! Core functionality of the Open Data Hub NIM operator: the custom resources,
//! their reconcilers and the runtime that drives them.
//! Tests are included in the module files and under `tests/`.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;
