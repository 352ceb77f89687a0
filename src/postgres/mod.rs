// ABOUTME: PostgreSQL connectivity for the source and target stores
// ABOUTME: Re-exports connection helpers used by the sync components

pub mod connection;

pub use connection::{
    connect, init_tls_policy, make_tls_connector, ConnectionSpec, ManagedClient,
    Reconnect,
};
