// ABOUTME: Schema descriptors and live-catalog introspection
// ABOUTME: Fields, indexes, views and the per-run table descriptor

pub mod ddl;
pub mod field;
pub mod index;
pub mod table;
pub mod view;

pub use field::Field;
pub use index::Index;
pub use table::{plan_indexes, temp_table_name, TableDescriptor};
pub use view::View;
