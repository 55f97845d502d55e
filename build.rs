// build.rs
//! Build script for compiling Protocol Buffer definitions

use std::io::{Error, ErrorKind, Result};

fn main() -> Result<()> {
    // Use the bundled protoc unless the environment provides one
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()
            .map_err(|e| Error::new(ErrorKind::NotFound, e.to_string()))?;
        std::env::set_var("PROTOC", protoc);
    }

    // Compile protobuf files
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/worker.proto"], &["proto"])?;

    // Recompile if proto files change
    println!("cargo:rerun-if-changed=proto/worker.proto");

    Ok(())
}
