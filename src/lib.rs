// src/lib.rs
//
// Adaptive traffic-signal control core for a four-approach intersection.
// The control loop owns the per-tick pipeline (simulator adapter, metrics
// engine, predictor, experience memory, decision controller) and exposes a
// command handle plus a snapshot stream for external transports.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod prediction;
pub mod synthetic;
pub mod types;
