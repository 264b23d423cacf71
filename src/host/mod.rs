//! Host-facing contract and stdio bridge for driving the orchestrator from
//! another process.

pub mod bridge;
pub mod contract;
pub mod handler;
pub mod stdio;
