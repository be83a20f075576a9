// ABOUTME: Command implementations for the table-sync CLI
// ABOUTME: Exports list and run commands

pub mod list;
pub mod run;

pub use list::list;
pub use run::run;
