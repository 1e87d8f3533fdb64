use crate::error::Result;
use super::types::SchemaFile;
use std::path::Path;

/// Parse a schema.yaml file into a SchemaFile
pub fn parse_schema(path: &Path) -> Result<SchemaFile> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaFile
pub fn parse_schema_str(content: &str) -> Result<SchemaFile> {
    let schema: SchemaFile = serde_yaml::from_str(content)?;
    Ok(schema)
}
