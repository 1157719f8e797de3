//! Differential synchronization of content-addressed payload DAGs.
//!
//! An *observable* process holds a DAG of opaque payloads, derives a Merkle
//! index from it (every node identified by a digest over its payload
//! identifier and the identifiers of its successors) and serves the index
//! over HTTP. An *observer* process polls the observable's root and, whenever
//! it changes, mirrors the new Merkle DAG locally while reusing every sub-DAG
//! whose Merkle identifier it already holds. Only changed subgraphs ever
//! cross the wire.

pub mod dag;
pub mod digest;
pub mod merkle;
pub mod observable;
pub mod observer;
pub mod protocol;
