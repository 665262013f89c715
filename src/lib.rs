//! Long-running monitoring agent for a Bitcoin Core node.
//!
//! Collectors sample the node on fixed, second-aligned cadences and append
//! what they see to per-collector CSV streams: JSON-RPC state snapshots,
//! systemd IP accounting counters, and (on capable builds) per-message P2P
//! traffic observed via kernel probes.

pub mod collector;
pub mod config;
pub mod pid;
pub mod rpc;
pub mod schedule;
pub mod sink;
pub mod supervisor;
pub mod tracer;
