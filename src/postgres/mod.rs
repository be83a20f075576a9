// ABOUTME: PostgreSQL connectivity for sources and destinations
// ABOUTME: Exports connection helpers and the connection provider capability

pub mod connection;
pub mod provider;

pub use connection::{connect, connect_with_retry, init_tls_policy};
pub use provider::{shares_connection, ConnectionGuard, ConnectionProvider, PgConnection};
