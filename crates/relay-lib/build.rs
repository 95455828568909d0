//! Build script for generating protobuf code
//!
//! Code generation only runs with the `proto-gen` feature. Without it the
//! hand-declared types in `src/proto/mod.rs` are used.

use std::path::PathBuf;
use std::process::Command;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=../../proto/relay/v1/relay.proto");

    if std::env::var_os("CARGO_FEATURE_PROTO_GEN").is_none() {
        return Ok(());
    }

    // Check if protoc is available
    let protoc_available =
        std::env::var("PROTOC").is_ok() || Command::new("protoc").arg("--version").output().is_ok();

    if !protoc_available {
        println!("cargo:warning=protoc not found, skipping proto generation");
        println!("cargo:warning=Install protoc or set PROTOC env var to generate proto code");
        return Ok(());
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    // The agent only dials the backend
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .out_dir(&out_dir)
        .compile(&["../../proto/relay/v1/relay.proto"], &["../../proto"])?;

    Ok(())
}
