use crate::aggregate::{self, Stage};
use crate::config::StoreConfig;
use crate::document::id::{IdGenerator, UuidGenerator, ID_LENGTH};
use crate::document::{self, io, Record, CREATED_AT_FIELD, ID_FIELD};
use crate::error::{Result, StoreError};
use crate::export::{self, ExportReport, RelationalSink};
use crate::schema::{parse_schema, Schema, SchemaFile};
use crate::validation::{self, IntegrityIssue};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The main entry point for flatdoc.
/// Opens a data directory, reads the optional schema file, and hands out one
/// shared [`Collection`] handle per collection name.
pub struct Store {
    config: StoreConfig,
    schemas: SchemaFile,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl Store {
    /// Open a store rooted at the given data directory, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(StoreConfig::new(path.as_ref()))
    }

    pub fn open_with(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let schema_path = config.schema_path();
        let schemas = if schema_path.exists() {
            let file = parse_schema(&schema_path)?;
            log::info!(
                "Loaded {} collection schemas from {}",
                file.collections.len(),
                schema_path.display()
            );
            file
        } else {
            SchemaFile::default()
        };

        Ok(Store {
            config,
            schemas,
            collections: RwLock::new(HashMap::new()),
        })
    }

    /// Bind `name` to `schema` and return its collection handle.
    ///
    /// Registering the same name again with an equal schema returns the
    /// existing handle; a different schema is an error.
    pub fn model(&self, name: &str, schema: Schema) -> Result<Arc<Collection>> {
        validate_collection_name(name)?;

        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned(name.to_string()))?;

        if let Some(existing) = collections.get(name) {
            if existing.schema() == &schema {
                return Ok(Arc::clone(existing));
            }
            return Err(StoreError::Schema(format!(
                "Collection '{name}' is already registered with a different schema"
            )));
        }

        let collection = Arc::new(Collection::new(
            name,
            schema,
            self.config.collection_path(name),
        ));
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    /// Get a collection handle, registering it from the schema file on first use.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        {
            let collections = self
                .collections
                .read()
                .map_err(|_| StoreError::LockPoisoned(name.to_string()))?;
            if let Some(existing) = collections.get(name) {
                return Ok(Arc::clone(existing));
            }
        }

        let schema = self.schemas.collections.get(name).cloned().ok_or_else(|| {
            StoreError::Schema(format!("Collection '{name}' not found in schema"))
        })?;
        self.model(name, schema)
    }

    /// Names from the schema file and from registered models, sorted.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::LockPoisoned("<store>".into()))?;
        let mut names: Vec<String> = self
            .schemas
            .collections
            .keys()
            .chain(collections.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Get the root data directory path
    pub fn root(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaFile {
        &self.schemas
    }

    /// Record counts and load state per collection.
    pub fn status(&self) -> Result<Value> {
        let mut collections = serde_json::Map::new();
        for name in self.collection_names()? {
            let col = self.collection(&name)?;
            collections.insert(
                name,
                serde_json::json!({
                    "count": col.loaded_count()?,
                    "state": col.status()?,
                    "path": col.path().display().to_string(),
                }),
            );
        }

        Ok(serde_json::json!({
            "data_dir": self.root().display().to_string(),
            "collections": collections,
        }))
    }

    /// Re-validate every record of every known collection.
    pub fn validate_all(&self) -> Result<Value> {
        let mut results = serde_json::Map::new();
        for name in self.collection_names()? {
            let col = self.collection(&name)?;
            let issues = col.check_integrity()?;
            results.insert(
                name,
                serde_json::json!({
                    "total": col.count()?,
                    "invalid": issues.len(),
                    "issues": issues,
                }),
            );
        }
        Ok(Value::Object(results))
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control);
    if !valid {
        return Err(StoreError::InvalidArgument(format!(
            "invalid collection name '{name}'"
        )));
    }
    Ok(())
}

/// Load state of a collection's in-memory cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Unloaded,
    Loaded,
    /// The last load attempt failed; the next operation retries.
    Failed,
}

struct Cache {
    status: LoadStatus,
    records: Vec<Record>,
    last_error: Option<String>,
}

/// What a write closure wants done with the collection
enum Mutation<T> {
    Unchanged(T),
    Replace(Vec<Record>, T),
}

/// One schema-bound collection persisted as a single JSON file.
///
/// All access goes through a reader/writer lock: mutations hold the write
/// lock across validate, modify and persist, so concurrent callers in one
/// process never lose an update. Nothing coordinates separate processes
/// writing the same file.
///
/// Every mutation rewrites the whole file, so write cost grows linearly with
/// the collection size.
pub struct Collection {
    name: String,
    schema: Schema,
    path: PathBuf,
    ids: Arc<dyn IdGenerator>,
    cache: RwLock<Cache>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Collection {
    pub fn new(name: impl Into<String>, schema: Schema, path: impl Into<PathBuf>) -> Self {
        Collection {
            name: name.into(),
            schema,
            path: path.into(),
            ids: Arc::new(UuidGenerator),
            cache: RwLock::new(Cache {
                status: LoadStatus::Unloaded,
                records: Vec::new(),
                last_error: None,
            }),
        }
    }

    /// Replace the identifier source for new records.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> Result<LoadStatus> {
        Ok(self.read_cache()?.status)
    }

    /// Record count of the in-memory cache, or `None` when nothing is loaded.
    /// Never triggers a load.
    pub fn loaded_count(&self) -> Result<Option<usize>> {
        let cache = self.read_cache()?;
        Ok((cache.status == LoadStatus::Loaded).then_some(cache.records.len()))
    }

    /// Message of the last failed load, if the collection is in the failed state.
    pub fn last_error(&self) -> Result<Option<String>> {
        Ok(self.read_cache()?.last_error.clone())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Load the collection file into memory. Does nothing once loaded.
    pub fn load(&self) -> Result<()> {
        let mut cache = self.write_cache()?;
        self.ensure_loaded(&mut cache)
    }

    fn ensure_loaded(&self, cache: &mut Cache) -> Result<()> {
        if cache.status == LoadStatus::Loaded {
            return Ok(());
        }

        match self.read_from_disk() {
            Ok(records) => {
                cache.records = records;
                cache.status = LoadStatus::Loaded;
                cache.last_error = None;
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to load collection '{}': {e}", self.name);
                cache.records.clear();
                cache.status = LoadStatus::Failed;
                cache.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn read_from_disk(&self) -> Result<Vec<Record>> {
        io::ensure_collection_file(&self.path)?;
        let records = io::read_records(&self.path)?;

        for issue in validation::check_integrity(&self.schema, &records) {
            log::warn!(
                "Collection '{}' record #{} ({}): {}",
                self.name,
                issue.index,
                issue.id.as_deref().unwrap_or("no id"),
                issue.messages.join("; ")
            );
        }

        log::debug!(
            "Loaded {} records for collection '{}' from {}",
            records.len(),
            self.name,
            self.path.display()
        );
        Ok(records)
    }

    fn read_cache(&self) -> Result<RwLockReadGuard<'_, Cache>> {
        self.cache
            .read()
            .map_err(|_| StoreError::LockPoisoned(self.name.clone()))
    }

    fn write_cache(&self) -> Result<RwLockWriteGuard<'_, Cache>> {
        self.cache
            .write()
            .map_err(|_| StoreError::LockPoisoned(self.name.clone()))
    }

    /// Run a read-only closure over the loaded records.
    fn read_with<T>(&self, f: impl FnOnce(&[Record]) -> T) -> Result<T> {
        {
            let cache = self.read_cache()?;
            if cache.status == LoadStatus::Loaded {
                return Ok(f(&cache.records));
            }
        }

        let mut cache = self.write_cache()?;
        self.ensure_loaded(&mut cache)?;
        Ok(f(&cache.records))
    }

    /// Run a mutation under the write lock. A replacement sequence is written
    /// to disk first and only then installed as the cache.
    fn write_with<T>(&self, f: impl FnOnce(&[Record]) -> Result<Mutation<T>>) -> Result<T> {
        let mut cache = self.write_cache()?;
        self.ensure_loaded(&mut cache)?;

        match f(&cache.records)? {
            Mutation::Unchanged(out) => Ok(out),
            Mutation::Replace(records, out) => {
                io::write_records(&self.path, &records)?;
                cache.records = records;
                Ok(out)
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Every record, in insertion order.
    pub fn get_all(&self) -> Result<Vec<Record>> {
        self.read_with(|records| records.to_vec())
    }

    pub fn count(&self) -> Result<usize> {
        self.read_with(|records| records.len())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Record>> {
        self.read_with(|records| {
            records
                .iter()
                .find(|r| document::record_id(r) == Some(id))
                .cloned()
        })
    }

    /// First record whose fields equal every key/value of `query`.
    pub fn find_one(&self, query: &Value) -> Result<Option<Record>> {
        let query = query_map(query)?;
        self.read_with(|records| {
            records
                .iter()
                .find(|r| document::matches(r, &query))
                .cloned()
        })
    }

    /// Every record matching `query`, in insertion order.
    pub fn find(&self, query: &Value) -> Result<Vec<Record>> {
        let query = query_map(query)?;
        self.read_with(|records| {
            records
                .iter()
                .filter(|r| document::matches(r, &query))
                .cloned()
                .collect()
        })
    }

    /// Re-validate the stored records without changing them.
    pub fn check_integrity(&self) -> Result<Vec<IntegrityIssue>> {
        self.read_with(|records| validation::check_integrity(&self.schema, records))
    }

    /// Run an aggregation pipeline over a snapshot of the collection.
    pub fn aggregate(&self, stages: &[Stage]) -> Result<Vec<Record>> {
        let snapshot = self.get_all()?;
        Ok(aggregate::run(stages, snapshot))
    }

    /// Parse a JSON array of stage descriptors and run it.
    pub fn aggregate_json(&self, pipeline: &Value) -> Result<Vec<Record>> {
        let stages = aggregate::parse_pipeline(pipeline)?;
        self.aggregate(&stages)
    }

    /// Insert every record into `table` of a relational sink.
    pub fn export_to(&self, sink: &mut dyn RelationalSink, table: &str) -> Result<ExportReport> {
        let snapshot = self.get_all()?;
        Ok(export::export_records(&snapshot, sink, table))
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Validate and append a new record. Returns the stored record.
    pub fn save(&self, raw: &Value) -> Result<Record> {
        self.write_with(|records| {
            let record = self.build_new(records, raw)?;
            let mut next = records.to_vec();
            next.push(record.clone());
            log::debug!("Inserted {:?} into '{}'", document::record_id(&record), self.name);
            Ok(Mutation::Replace(next, record))
        })
    }

    /// Merge `patch` into the record with this id. Returns `None`, without
    /// writing, when no such record exists.
    pub fn find_by_id_and_update(&self, id: &str, patch: &Value) -> Result<Option<Record>> {
        let patch = patch_map(patch)?;
        self.write_with(|records| {
            let Some(index) = records.iter().position(|r| document::record_id(r) == Some(id))
            else {
                return Ok(Mutation::Unchanged(None));
            };

            let updated = self.merge(records, index, &patch)?;
            let mut next = records.to_vec();
            next[index] = updated.clone();
            Ok(Mutation::Replace(next, Some(updated)))
        })
    }

    /// Update the first record matching `filter`, or insert `update` as a new
    /// record when nothing matches.
    ///
    /// An updated record is written with `createdAt`, `updatedAt` and `_id`
    /// as its last fields.
    pub fn find_one_and_update(&self, filter: &Value, update: &Value) -> Result<Record> {
        let filter = query_map(filter)?;
        let update = patch_map(update)?;
        self.write_with(|records| {
            let mut next = records.to_vec();
            let record = match records.iter().position(|r| document::matches(r, &filter)) {
                Some(index) => {
                    let updated = document::move_reserved_to_end(self.merge(records, index, &update)?);
                    next[index] = updated.clone();
                    updated
                }
                None => {
                    let inserted = self.build_new(records, &Value::Object(update))?;
                    next.push(inserted.clone());
                    inserted
                }
            };
            Ok(Mutation::Replace(next, record))
        })
    }

    /// Remove the record with this id. Returns `None`, without writing, when
    /// no such record exists.
    pub fn find_by_id_and_delete(&self, id: &str) -> Result<Option<Record>> {
        self.write_with(|records| {
            let Some(index) = records.iter().position(|r| document::record_id(r) == Some(id))
            else {
                return Ok(Mutation::Unchanged(None));
            };

            let mut next = records.to_vec();
            let removed = next.remove(index);
            Ok(Mutation::Replace(next, Some(removed)))
        })
    }

    fn build_new(&self, records: &[Record], raw: &Value) -> Result<Record> {
        let fields = validation::validate_record(&self.schema, raw, records, None)?;

        let id = match raw.get(ID_FIELD) {
            None | Some(Value::Null) => self.ids.generate(),
            Some(Value::String(id)) => {
                if id.chars().count() != ID_LENGTH {
                    return Err(StoreError::Validation(vec![format!(
                        "{ID_FIELD} must be a {ID_LENGTH}-character identifier, got \"{id}\""
                    )]));
                }
                if records.iter().any(|r| document::record_id(r) == Some(id.as_str())) {
                    return Err(StoreError::Validation(vec![format!(
                        "{ID_FIELD} must be unique: {id} already exists"
                    )]));
                }
                id.clone()
            }
            Some(other) => {
                return Err(StoreError::Validation(vec![format!(
                    "{ID_FIELD} must be a string, got {other}"
                )]))
            }
        };

        let now = self.schema.timestamps().then(|| Value::String(document::now_timestamp()));
        Ok(document::assemble(&id, fields, now.clone(), now))
    }

    fn merge(&self, records: &[Record], index: usize, patch: &Record) -> Result<Record> {
        let existing = &records[index];
        let id = match document::record_id(existing) {
            Some(id) => id.to_string(),
            None => self.ids.generate(),
        };

        let mut merged = document::user_fields(existing);
        for (key, value) in patch {
            if !document::is_reserved(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        let fields =
            validation::validate_record(&self.schema, &Value::Object(merged), records, Some(&id))?;

        let (created, updated) = if self.schema.timestamps() {
            let now = Value::String(document::now_timestamp());
            let created = existing
                .get(CREATED_AT_FIELD)
                .cloned()
                .unwrap_or_else(|| now.clone());
            (Some(created), Some(now))
        } else {
            (None, None)
        };
        Ok(document::assemble(&id, fields, created, updated))
    }
}

fn query_map(query: &Value) -> Result<Record> {
    match query {
        Value::Null => Ok(Record::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(StoreError::InvalidArgument(format!(
            "query must be a JSON object, got {other}"
        ))),
    }
}

fn patch_map(patch: &Value) -> Result<Record> {
    patch.as_object().cloned().ok_or_else(|| {
        StoreError::Validation(vec!["update must be a JSON object".into()])
    })
}
