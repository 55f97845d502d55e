// src/grpc/proto.rs
//! Protocol buffer bindings for `proto/worker.proto` (package `zoo.worker`),
//! generated by `build.rs`

#![allow(clippy::derive_partial_eq_without_eq)]

tonic::include_proto!("zoo.worker");
