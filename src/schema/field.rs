// ABOUTME: Column descriptor derived from catalog metadata
// ABOUTME: Renders DDL fragments; equality and hashing use the column name only

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};

use tokio_postgres::Row;

use crate::utils::quote_ident;

/// Information about a table column.
///
/// Two fields are equal when their names are equal, and a field compares
/// equal to its name as a string, so field lists can be filtered by
/// plain column names.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub type_name: String,
    pub length_limit: Option<i32>,
    pub array: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            length_limit: None,
            array: false,
        }
    }

    /// Build a field from `information_schema.columns` values.
    ///
    /// `character*` types keep their maximum length. A `varchar[]` column is
    /// reported by the catalog as `ARRAY`/`_varchar` and is rendered as
    /// `character varying(256)[]`; other arrays and user-defined types fall
    /// back to the catalog's `udt_name`.
    pub fn from_catalog(
        name: impl Into<String>,
        data_type: &str,
        udt_name: Option<&str>,
        character_maximum_length: Option<i32>,
    ) -> Self {
        let mut field = Field::new(name, data_type);

        if data_type.contains("character") {
            field.length_limit = character_maximum_length;
        }

        match (data_type, udt_name) {
            ("ARRAY", Some("_varchar")) => {
                field.type_name = "character varying".to_string();
                field.length_limit = Some(256);
                field.array = true;
            }
            ("ARRAY", Some(udt)) => {
                field.type_name = udt.trim_start_matches('_').to_string();
                field.array = true;
            }
            ("USER-DEFINED", Some(udt)) => field.type_name = udt.to_string(),
            _ => {}
        }

        field
    }

    /// Build a field from a row of [`super::ddl::TABLE_FIELDS_SQL`].
    pub fn from_row(row: &Row) -> Self {
        Field::from_catalog(
            row.get::<_, String>("column_name"),
            &row.get::<_, String>("data_type"),
            row.get::<_, Option<String>>("udt_name").as_deref(),
            row.get::<_, Option<i32>>("character_maximum_length"),
        )
    }

    /// Column definition, e.g. `"name" character varying(123)`.
    pub fn ddl(&self) -> String {
        let mut ddl = format!("{} {}", quote_ident(&self.name), self.type_name);
        if let Some(limit) = self.length_limit {
            ddl.push_str(&format!("({})", limit));
        }
        if self.array {
            ddl.push_str("[]");
        }
        ddl
    }

    /// Whether a single-column B-tree index on this field is worth creating.
    pub fn auto_index(&self) -> bool {
        if self.array {
            return false;
        }
        let t = self.type_name.as_str();
        matches!(
            t,
            "integer" | "smallint" | "bigint" | "int" | "int2" | "int4" | "int8" | "boolean" | "bool"
        ) || t.starts_with("timestamp")
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Field {}

impl PartialEq<str> for Field {
    fn eq(&self, other: &str) -> bool {
        self.name == other
    }
}

impl PartialEq<&str> for Field {
    fn eq(&self, other: &&str) -> bool {
        self.name == *other
    }
}

impl PartialEq<String> for Field {
    fn eq(&self, other: &String) -> bool {
        &self.name == other
    }
}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Borrow<str> for Field {
    fn borrow(&self) -> &str {
        &self.name
    }
}
