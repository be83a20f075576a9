// ABOUTME: Resolved description of a destination table for one sync run
// ABOUTME: Combines destination configuration with the source's live schema

use super::field::Field;
use super::index::Index;

/// Everything the destination needs to generate SQL for one run.
///
/// Built fresh for every copier operation so schema changes in the source
/// are picked up on the next run.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
    /// `None` only for query sources without a configured key.
    pub primary_key: Option<String>,
    pub sequence_field: Option<String>,
    /// Column names copied from source to destination, in order.
    pub fields: Vec<String>,
    pub indexes: Vec<Index>,
    pub soft_delete_field: Option<String>,
}

impl TableDescriptor {
    pub fn temp_name(&self) -> String {
        temp_table_name(&self.name)
    }
}

/// Staging table name for a destination table.
pub fn temp_table_name(table: &str) -> String {
    format!("temp_{}", table)
}

/// Indexes to carry over: every viable source index plus, when
/// `auto_index` is set, one single-column index for each auto-indexable
/// field that no existing index leads with.
pub fn plan_indexes(
    table: &str,
    fields: &[String],
    source_fields: &[Field],
    source_indexes: &[Index],
    auto_index: bool,
) -> Vec<Index> {
    let mut planned: Vec<Index> = source_indexes
        .iter()
        .filter(|index| index.is_viable(fields))
        .map(|index| index.retarget(table))
        .collect();

    if auto_index {
        for field in source_fields {
            if !field.auto_index() || !fields.iter().any(|f| field == f) {
                continue;
            }
            let covered = planned
                .iter()
                .any(|index| index.leading_column() == Some(field.name.as_str()));
            if !covered {
                planned.push(Index::new(table, None, vec![field.name.clone()]));
            }
        }
    }

    planned
}
