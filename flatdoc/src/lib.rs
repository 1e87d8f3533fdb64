pub mod aggregate;
pub mod config;
pub mod document;
pub mod error;
pub mod export;
pub mod schema;
pub mod store;
pub mod validation;

pub use aggregate::{Accumulator, GroupKey, GroupSpec, Stage};
pub use config::StoreConfig;
pub use document::id::{IdGenerator, UuidGenerator};
pub use document::Record;
pub use error::{ErrorKind, Result, StoreError};
pub use export::{ExportReport, RelationalSink, RowOutcome, SqliteSink};
pub use schema::{FieldDescriptor, FieldType, Schema, SchemaFile};
pub use store::{Collection, LoadStatus, Store};
pub use validation::IntegrityIssue;
