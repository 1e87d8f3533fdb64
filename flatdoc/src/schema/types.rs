use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Top-level contents of a `schema.yaml` file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub collections: BTreeMap<String, Schema>,
}

/// Field type enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    /// Any other tag. Accepted at definition time, rejected by every validation.
    #[serde(untagged)]
    Unsupported(std::string::String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Unsupported(name) => name,
        }
    }
}

/// Definition of a single field in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub unique: bool,
    /// The field holds the `_id` of a record in another collection.
    #[serde(rename = "ref", default)]
    pub reference: bool,
}

impl FieldDescriptor {
    pub fn new(field_type: FieldType) -> Self {
        FieldDescriptor {
            field_type,
            required: false,
            default: None,
            unique: false,
            reference: false,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn array() -> Self {
        Self::new(FieldType::Array)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn reference(mut self) -> Self {
        self.reference = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// The declared field set of a collection plus its options.
///
/// Fields keep their declaration order; validation walks them in that order
/// and sanitized records are laid out the same way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSchema", into = "RawSchema")]
pub struct Schema {
    fields: Vec<(String, FieldDescriptor)>,
    timestamps: bool,
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    /// An empty schema whose records carry `createdAt`/`updatedAt`.
    pub fn with_timestamps() -> Self {
        Schema {
            fields: Vec::new(),
            timestamps: true,
        }
    }

    /// Add or replace a field. A replaced field keeps its position.
    pub fn add(&mut self, field: impl Into<String>, descriptor: FieldDescriptor) -> &mut Self {
        let field = field.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some((_, existing)) => *existing = descriptor,
            None => self.fields.push((field, descriptor)),
        }
        self
    }

    /// By-value variant of [`Schema::add`] for building a schema in one expression.
    pub fn field(mut self, field: impl Into<String>, descriptor: FieldDescriptor) -> Self {
        self.add(field, descriptor);
        self
    }

    pub fn set_timestamps(&mut self, enabled: bool) -> &mut Self {
        self.timestamps = enabled;
        self
    }

    pub fn timestamps(&self) -> bool {
        self.timestamps
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDescriptor)> {
        self.fields.iter().map(|(name, d)| (name.as_str(), d))
    }

    pub fn get(&self, field: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, d)| d)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Serialized shape of a [`Schema`]. `serde_json::Map` keeps field order
/// because the crate enables `preserve_order`.
#[derive(Serialize, Deserialize)]
struct RawSchema {
    #[serde(default)]
    timestamps: bool,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

impl TryFrom<RawSchema> for Schema {
    type Error = String;

    fn try_from(raw: RawSchema) -> Result<Self, Self::Error> {
        let mut schema = Schema::new();
        schema.set_timestamps(raw.timestamps);
        for (name, value) in raw.fields {
            let descriptor: FieldDescriptor = serde_json::from_value(value)
                .map_err(|e| format!("field '{name}': {e}"))?;
            schema.add(name, descriptor);
        }
        Ok(schema)
    }
}

impl From<Schema> for RawSchema {
    fn from(schema: Schema) -> Self {
        let fields = schema
            .fields
            .into_iter()
            .map(|(name, d)| {
                let value = serde_json::to_value(d).unwrap_or(Value::Null);
                (name, value)
            })
            .collect();
        RawSchema {
            timestamps: schema.timestamps,
            fields,
        }
    }
}
