//! Cluster relay agent: configuration and the health/metrics API

pub mod api;
pub mod config;
