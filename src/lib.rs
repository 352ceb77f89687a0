// ABOUTME: Library root for the sync worker
// ABOUTME: Exposes configuration, the table registry, store connectors and the sync pipeline

pub mod config;
pub mod postgres;
pub mod registry;
pub mod sync;
pub mod utils;
