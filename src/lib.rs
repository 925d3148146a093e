//! Container telemetry streaming: demultiplexes engine log streams, derives
//! resource metrics from raw stats samples and republishes both as
//! server-sent event streams.

pub mod client;
pub mod config;
pub mod decoders;
pub mod engine;
pub mod error;
pub mod models;
pub mod publisher;
pub mod routes;
pub mod session;
