//! # CRD Generator
//!
//! Generates the Kubernetes CustomResourceDefinition YAML for the operator's
//! three resources from their Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > config/crd/bases/nim.opendatahub.io.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use nim_operator::crd::{NimAccount, NimApp, NimRuntime};

fn main() {
    let crds = [NimAccount::crd(), NimApp::crd(), NimRuntime::crd()];

    // Print header comments warning that this file should not be edited manually
    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("# Fix schema issues in the Rust types under src/crd/");
    println!("#");
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
