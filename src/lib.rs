// ABOUTME: Library root for table-sync
// ABOUTME: Keeps PostgreSQL tables in sync across connections via rebuild, diff and incremental strategies

pub mod commands;
pub mod config;
pub mod copier;
pub mod destination;
pub mod error;
pub mod postgres;
pub mod registry;
pub mod schema;
pub mod source;
pub mod utils;

pub use config::SyncConfig;
pub use copier::{Copier, Plan, Recovery, Strategy, SyncReport};
pub use destination::{AfterCreate, Destination, LoadOptions, SqlHook};
pub use error::{Result, SyncError};
pub use postgres::{ConnectionProvider, PgConnection};
pub use registry::{BatchStats, LinkRegistry, Operation};
pub use source::{QuerySource, Source, SourceSchema, TableSource};
