//! Persistence for tether: task records, container specs, computing
//! resources with their conf payloads, and per-user key pairs.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
