//! Dalston: a distributed speech-to-text orchestration platform.
//!
//! The value here is the fabric, not any single model: a gateway admits
//! batch uploads and realtime streams, an orchestrator drives
//! multi-stage pipelines across heterogeneous engine workers over a
//! shared bus, results persist in the durable store, and terminal
//! transitions fan out as signed webhooks.
//!
//! Services ship as one binary with subcommands (see `main.rs`); each
//! runs as its own process and scales horizontally. Cross-process state
//! lives only in the durable store (authoritative history) and the bus
//! (transient coordination).

pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod model;
pub mod objectstore;
pub mod orchestrator;
pub mod realtime;
pub mod registry;
pub mod webhook;
pub mod worker;
