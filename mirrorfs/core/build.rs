// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build Script for mirrorfs-core
//!
//! Compiles the `mirrorfs.v1` Protocol Buffer definitions into tonic client and
//! server stubs. Generated code lands in `OUT_DIR` and is pulled in with
//! `tonic::include_proto!` from `src/infrastructure/proto.rs`.
//!
//! # Dependencies
//!
//! - **protoc**: Protocol buffer compiler (vendored via `protoc-bin-vendored`)
//! - **tonic-prost-build**: Code generator for Rust gRPC stubs

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost at the vendored protoc so builds do not need a system install
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let protos = ["../../proto/mirrorfs/v1/mirrorfs.proto"];

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&protos, &["../../proto"])?;

    for proto in protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    Ok(())
}
