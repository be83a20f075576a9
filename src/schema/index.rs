// ABOUTME: Index descriptor carried from source to destination
// ABOUTME: Renders B-tree CREATE INDEX statements

use crate::utils::{quote_ident, quote_ident_list};

/// An index over one or more columns of `table`.
///
/// `name` is `None` for indexes we create ourselves; PostgreSQL picks the
/// name in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub table: String,
    pub name: Option<String>,
    pub columns: Vec<String>,
}

impl Index {
    pub fn new(table: impl Into<String>, name: Option<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            name,
            columns,
        }
    }

    /// The same index definition against another table.
    pub fn retarget(&self, table: &str) -> Self {
        Self {
            table: table.to_string(),
            name: self.name.clone(),
            columns: self.columns.clone(),
        }
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE INDEX ON {} USING BTREE ({})",
            quote_ident(&self.table),
            quote_ident_list(&self.columns)
        )
    }

    /// True when every indexed column is among `fields`.
    pub fn is_viable<S: AsRef<str>>(&self, fields: &[S]) -> bool {
        !self.columns.is_empty()
            && self
                .columns
                .iter()
                .all(|column| fields.iter().any(|f| f.as_ref() == column))
    }

    /// First indexed column.
    pub fn leading_column(&self) -> Option<&str> {
        self.columns.first().map(String::as_str)
    }
}
