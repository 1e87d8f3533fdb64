use std::path::{Path, PathBuf};

/// Environment variable naming the data directory.
pub const DATA_DIR_ENV: &str = "FLATDOC_DATA_DIR";

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_SCHEMA_FILE: &str = "schema.yaml";

/// Where a store keeps its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding one `<collection>.json` file per collection.
    pub data_dir: PathBuf,
    /// Optional schema file, relative to `data_dir`.
    pub schema_file: String,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            data_dir: data_dir.into(),
            schema_file: DEFAULT_SCHEMA_FILE.to_string(),
        }
    }

    /// Read the data directory from `FLATDOC_DATA_DIR`, falling back to `./data`.
    pub fn from_env() -> Self {
        let data_dir = std::env::var(DATA_DIR_ENV).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        Self::new(data_dir)
    }

    pub fn with_schema_file(mut self, schema_file: impl Into<String>) -> Self {
        self.schema_file = schema_file.into();
        self
    }

    pub fn schema_path(&self) -> PathBuf {
        self.data_dir.join(&self.schema_file)
    }

    pub fn collection_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.json"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}
