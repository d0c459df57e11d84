//! Schema context rendering for the generation prompt.

pub mod catalog;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One table definition as handed to the generation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub ddl: String,
    pub description: Option<String>,
}

/// Renders table DDL into a bounded textual context. Truncation is
/// deterministic so identical inputs always produce the identical prompt.
pub struct SchemaContextBuilder {
    max_chars: usize,
    references_re: Regex,
}

impl SchemaContextBuilder {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            references_re: Regex::new(r"(?i)REFERENCES\s+(\w+)\s*\((\w+)\)").unwrap(),
        }
    }

    /// Format schema DDL for the generation prompt.
    pub fn render(&self, tables: &[TableSchema]) -> String {
        if tables.is_empty() {
            return "-- No schema information available".to_string();
        }

        let mut parts = Vec::new();

        // Header
        parts.push("-- Database Schema".to_string());
        parts.push(format!(
            "-- Tables: {}",
            tables
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        parts.push(String::new());

        for table in tables {
            parts.push(format!("-- Table: {}", table.name));

            if let Some(description) = &table.description {
                parts.push(format!("-- Description: {}", description));
            }

            parts.push(table.ddl.clone());
            parts.push(String::new());
        }

        let schema_text = parts.join("\n");

        if schema_text.len() > self.max_chars {
            warn!(
                "Schema exceeds size limit: {} > {}",
                schema_text.len(),
                self.max_chars
            );
            return self.truncate(&schema_text);
        }

        schema_text
    }

    /// Like [`render`], with foreign-key relationships summarized up front.
    /// Used by the schema inspection endpoint.
    pub fn render_with_relationships(&self, tables: &[TableSchema]) -> String {
        if tables.is_empty() {
            return "-- No schema information available".to_string();
        }

        let relationships = self.extract_relationships(tables);
        if relationships.is_empty() {
            return self.render(tables);
        }

        let mut parts = Vec::new();
        parts.push("-- Database Schema with Relationships".to_string());
        parts.push(format!(
            "-- Tables: {}",
            tables
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        parts.push(String::new());

        parts.push("-- Relationships:".to_string());
        for rel in relationships {
            parts.push(format!("-- {}", rel));
        }
        parts.push(String::new());

        for table in tables {
            parts.push(format!("-- Table: {}", table.name));
            if let Some(description) = &table.description {
                parts.push(format!("-- Description: {}", description));
            }
            parts.push(table.ddl.clone());
            parts.push(String::new());
        }

        parts.join("\n")
    }

    /// `table -> referenced_table.column` lines pulled from REFERENCES
    /// clauses in the DDL.
    fn extract_relationships(&self, tables: &[TableSchema]) -> Vec<String> {
        let mut relationships = Vec::new();

        for table in tables {
            for cap in self.references_re.captures_iter(&table.ddl) {
                if let (Some(ref_table), Some(ref_column)) = (cap.get(1), cap.get(2)) {
                    relationships.push(format!(
                        "{} -> {}.{}",
                        table.name,
                        ref_table.as_str(),
                        ref_column.as_str()
                    ));
                }
            }
        }

        relationships
    }

    /// Cut at 80% of the size limit, back up to the previous line break
    /// when it lands in the final 10%, then append the warning trailer.
    fn truncate(&self, schema_text: &str) -> String {
        let max_size = (self.max_chars as f64 * 0.8) as usize;

        if schema_text.len() <= max_size {
            return schema_text.to_string();
        }

        // Respect char boundaries when slicing
        let mut cut = max_size;
        while cut > 0 && !schema_text.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut truncated = &schema_text[..cut];

        if let Some(last_newline) = truncated.rfind('\n') {
            if last_newline > (max_size as f64 * 0.9) as usize {
                truncated = &truncated[..last_newline];
            }
        }

        let mut out = truncated.to_string();
        out.push_str("\n\n-- WARNING: Schema truncated due to size limits");
        out.push_str("\n-- Some table definitions may be incomplete");
        out
    }
}
