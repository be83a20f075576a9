// ABOUTME: Dependent view captured before a destructive rebuild
// ABOUTME: Replayed afterwards with CREATE OR REPLACE VIEW

use crate::utils::quote_ident;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub schema: String,
    pub name: String,
    pub definition: String,
}

impl View {
    pub fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            definition: definition.into(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    pub fn create_sql(&self) -> String {
        let body = self.definition.trim().trim_end_matches(';');
        format!(
            "CREATE OR REPLACE VIEW {} AS ({})",
            self.qualified_name(),
            body
        )
    }
}
