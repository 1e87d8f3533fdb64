use crate::document::{self, id::ID_LENGTH, Record, ID_FIELD};
use crate::error::{Result, StoreError};
use crate::schema::{FieldType, Schema};
use serde::Serialize;
use serde_json::Value;

/// Result of checking a sanitized record
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A stored record that no longer satisfies its schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityIssue {
    /// Position of the record in the collection file.
    pub index: usize,
    pub id: Option<String>,
    pub messages: Vec<String>,
}

struct TypeValidator {
    expected: &'static str,
    check: fn(&Value) -> bool,
}

const STRING: TypeValidator = TypeValidator {
    expected: "a string",
    check: Value::is_string,
};

const NUMBER: TypeValidator = TypeValidator {
    expected: "a number",
    check: Value::is_number,
};

const BOOLEAN: TypeValidator = TypeValidator {
    expected: "a boolean",
    check: Value::is_boolean,
};

const ARRAY: TypeValidator = TypeValidator {
    expected: "an array",
    check: Value::is_array,
};

fn validator_for(field_type: &FieldType) -> Option<&'static TypeValidator> {
    match field_type {
        FieldType::String => Some(&STRING),
        FieldType::Number => Some(&NUMBER),
        FieldType::Boolean => Some(&BOOLEAN),
        FieldType::Array => Some(&ARRAY),
        FieldType::Unsupported(_) => None,
    }
}

/// Keep only declared fields, substituting defaults for absent or null values.
///
/// `0`, `""` and `false` are values, not absences.
pub fn sanitize(schema: &Schema, raw: &Value) -> Result<Record> {
    let input = raw
        .as_object()
        .ok_or_else(|| StoreError::Validation(vec!["record must be a JSON object".into()]))?;

    let mut sanitized = Record::new();
    for (name, descriptor) in schema.fields() {
        match input.get(name) {
            Some(value) if !value.is_null() => {
                sanitized.insert(name.to_string(), value.clone());
            }
            _ => {
                if let Some(default) = &descriptor.default {
                    sanitized.insert(name.to_string(), default.clone());
                }
            }
        }
    }
    Ok(sanitized)
}

/// Check a sanitized record against the schema and the other records of the
/// collection. `self_id` names the record being replaced, if any, so that it
/// does not collide with itself on unique fields.
///
/// An invalid reference aborts immediately with [`StoreError::InvalidReference`];
/// every other problem is collected into the returned result.
pub fn check_record(
    schema: &Schema,
    record: &Record,
    existing: &[Record],
    self_id: Option<&str>,
) -> Result<ValidationResult> {
    check_fields(schema, record, existing, |_, other| {
        self_id.is_some() && document::record_id(other) == self_id
    })
}

/// Field checks shared by writes and integrity scans. `is_self` picks out the
/// entry of `existing` that is the record under check.
fn check_fields(
    schema: &Schema,
    record: &Record,
    existing: &[Record],
    is_self: impl Fn(usize, &Record) -> bool,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();
    let mut seen_unique: Vec<&Value> = Vec::new();

    for (name, descriptor) in schema.fields() {
        let value = match record.get(name) {
            Some(value) => value,
            None => {
                if descriptor.required {
                    result.errors.push(format!("{name} is required"));
                }
                continue;
            }
        };

        if descriptor.reference && !is_reference(value) {
            return Err(StoreError::InvalidReference {
                field: name.to_string(),
                value: value.to_string(),
            });
        }

        match validator_for(&descriptor.field_type) {
            Some(validator) => {
                if !(validator.check)(value) {
                    result.errors.push(format!(
                        "{name} must be {}, got {}",
                        validator.expected,
                        type_name(value)
                    ));
                }
            }
            None => {
                result.errors.push(format!(
                    "{name} has unsupported type '{}'",
                    descriptor.field_type.as_str()
                ));
                continue;
            }
        }

        if descriptor.unique {
            let repeated = seen_unique.iter().any(|v| document::values_equal(v, value));
            if repeated || collides(existing, &is_self, name, value) {
                result
                    .errors
                    .push(format!("{name} must be unique: {value} already exists"));
            }
            seen_unique.push(value);
        }
    }

    Ok(result)
}

/// Sanitize and validate a raw record. Returns the sanitized record or every
/// accumulated message as [`StoreError::Validation`].
pub fn validate_record(
    schema: &Schema,
    raw: &Value,
    existing: &[Record],
    self_id: Option<&str>,
) -> Result<Record> {
    let sanitized = sanitize(schema, raw)?;
    let result = check_record(schema, &sanitized, existing, self_id)?;

    if !result.is_ok() {
        return Err(StoreError::Validation(result.errors));
    }
    Ok(sanitized)
}

/// Re-validate stored records. Nothing is modified; problems are returned.
pub fn check_integrity(schema: &Schema, records: &[Record]) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();

    for (index, record) in records.iter().enumerate() {
        let id = document::record_id(record);
        let mut messages = Vec::new();

        match id {
            None => messages.push(format!("{ID_FIELD} is missing")),
            Some(id) => {
                let duplicates = records
                    .iter()
                    .filter(|other| document::record_id(other) == Some(id))
                    .count();
                if duplicates > 1 {
                    messages.push(format!("{ID_FIELD} {id} appears {duplicates} times"));
                }
            }
        }

        for key in record.keys() {
            if !document::is_reserved(key) && !schema.contains(key) {
                messages.push(format!("unexpected field '{key}'"));
            }
        }

        let raw = Value::Object(document::user_fields(record));
        let checked = sanitize(schema, &raw)
            .and_then(|s| check_fields(schema, &s, records, |position, _| position == index));
        match checked {
            Ok(result) => messages.extend(result.errors),
            Err(e) => messages.extend(e.messages()),
        }

        if !messages.is_empty() {
            issues.push(IntegrityIssue {
                index,
                id: id.map(str::to_string),
                messages,
            });
        }
    }

    issues
}

fn is_reference(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.chars().count() == ID_LENGTH)
}

fn collides(
    existing: &[Record],
    is_self: &impl Fn(usize, &Record) -> bool,
    field: &str,
    value: &Value,
) -> bool {
    existing.iter().enumerate().any(|(position, other)| {
        !is_self(position, other)
            && other
                .get(field)
                .is_some_and(|v| document::values_equal(v, value))
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const AUTHOR_ID: &str = "8f14e45f-ceea-467f-a0f6-2a1bc3c2d9e1";

    fn test_schema() -> Schema {
        Schema::with_timestamps()
            .field("name", FieldDescriptor::string().required())
            .field("email", FieldDescriptor::string().required().unique())
            .field("role", FieldDescriptor::string().default_value("member"))
            .field("age", FieldDescriptor::number().default_value(18))
            .field("active", FieldDescriptor::boolean().default_value(true))
            .field("tags", FieldDescriptor::array())
            .field("author", FieldDescriptor::string().reference())
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_valid_record() {
        let schema = test_schema();
        let raw = json!({ "name": "Alice", "email": "alice@test.com", "tags": ["a"] });
        let sanitized = validate_record(&schema, &raw, &[], None).unwrap();

        assert_eq!(
            sanitized,
            record(json!({
                "name": "Alice",
                "email": "alice@test.com",
                "role": "member",
                "age": 18,
                "active": true,
                "tags": ["a"]
            }))
        );
    }

    #[test]
    fn test_unknown_fields_are_dropped() {
        let schema = test_schema();
        let raw = json!({ "name": "Alice", "email": "a@test.com", "extra": 1, "_id": "x" });
        let sanitized = validate_record(&schema, &raw, &[], None).unwrap();
        assert!(!sanitized.contains_key("extra"));
        assert!(!sanitized.contains_key("_id"));
    }

    #[test]
    fn test_falsy_values_are_kept() {
        let schema = test_schema();
        let raw = json!({ "name": "", "email": "a@test.com", "age": 0, "active": false });
        let sanitized = validate_record(&schema, &raw, &[], None).unwrap();

        assert_eq!(sanitized["name"], json!(""));
        assert_eq!(sanitized["age"], json!(0));
        assert_eq!(sanitized["active"], json!(false));
    }

    #[test]
    fn test_null_takes_default() {
        let schema = test_schema();
        let raw = json!({ "name": "A", "email": "a@test.com", "role": null });
        let sanitized = validate_record(&schema, &raw, &[], None).unwrap();
        assert_eq!(sanitized["role"], json!("member"));
    }

    #[test]
    fn test_missing_required_fields_accumulate() {
        let schema = test_schema();
        let err = validate_record(&schema, &json!({}), &[], None).unwrap_err();

        match err {
            StoreError::Validation(messages) => {
                assert_eq!(messages, vec!["name is required", "email is required"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_type_mismatches() {
        let schema = test_schema();
        let raw = json!({
            "name": 42,
            "email": "a@test.com",
            "age": "old",
            "active": "yes",
            "tags": "a,b"
        });
        let messages = validate_record(&schema, &raw, &[], None)
            .unwrap_err()
            .messages();

        assert_eq!(messages.len(), 4);
        assert!(messages[0].starts_with("name must be a string"));
        assert!(messages[1].starts_with("age must be a number"));
        assert!(messages[2].starts_with("active must be a boolean"));
        assert!(messages[3].starts_with("tags must be an array"));
    }

    #[test]
    fn test_unique_against_existing() {
        let schema = test_schema();
        let existing = vec![record(json!({ "_id": "one", "email": "a@test.com" }))];
        let raw = json!({ "name": "B", "email": "a@test.com" });

        let messages = validate_record(&schema, &raw, &existing, None)
            .unwrap_err()
            .messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("email"));

        // The record being updated does not collide with itself
        assert!(validate_record(&schema, &raw, &existing, Some("one")).is_ok());
    }

    #[test]
    fn test_unique_within_one_pass() {
        let schema = Schema::new()
            .field("primary", FieldDescriptor::string().unique())
            .field("secondary", FieldDescriptor::string().unique());
        let raw = json!({ "primary": "same", "secondary": "same" });

        let messages = validate_record(&schema, &raw, &[], None)
            .unwrap_err()
            .messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("secondary must be unique"));
    }

    #[test]
    fn test_absent_unique_value_is_exempt() {
        let schema = Schema::new().field("code", FieldDescriptor::string().unique());
        let existing = vec![record(json!({ "_id": "one" }))];
        assert!(validate_record(&schema, &json!({}), &existing, None).is_ok());
    }

    #[test]
    fn test_reference_fails_fast() {
        let schema = test_schema();
        // name is missing too, but the reference error wins
        let raw = json!({ "email": "a@test.com", "author": "short" });
        let err = validate_record(&schema, &raw, &[], None).unwrap_err();

        match err {
            StoreError::InvalidReference { field, .. } => assert_eq!(field, "author"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_valid_reference() {
        let schema = test_schema();
        let raw = json!({ "name": "A", "email": "a@test.com", "author": AUTHOR_ID });
        let sanitized = validate_record(&schema, &raw, &[], None).unwrap();
        assert_eq!(sanitized["author"], json!(AUTHOR_ID));
    }

    #[test]
    fn test_unsupported_type_always_fails() {
        let schema = Schema::new().field("meta", FieldDescriptor::new(FieldType::Unsupported("object".into())));
        let messages = validate_record(&schema, &json!({ "meta": {} }), &[], None)
            .unwrap_err()
            .messages();
        assert_eq!(messages, vec!["meta has unsupported type 'object'"]);
    }

    #[test]
    fn test_non_object_input() {
        let schema = test_schema();
        let messages = validate_record(&schema, &json!([1, 2]), &[], None)
            .unwrap_err()
            .messages();
        assert_eq!(messages, vec!["record must be a JSON object"]);
    }

    #[test]
    fn test_check_integrity() {
        let schema = test_schema();
        let records = vec![
            record(json!({ "_id": "one", "name": "A", "email": "a@test.com" })),
            record(json!({ "_id": "two", "email": "a@test.com", "legacy": true })),
            record(json!({ "name": "C", "email": "c@test.com" })),
        ];

        let issues = check_integrity(&schema, &records);
        assert_eq!(issues.len(), 3);

        assert_eq!(issues[0].index, 0);
        assert!(issues[0].messages[0].starts_with("email must be unique"));

        assert_eq!(issues[1].id.as_deref(), Some("two"));
        assert!(issues[1].messages.contains(&"unexpected field 'legacy'".to_string()));
        assert!(issues[1].messages.contains(&"name is required".to_string()));

        assert_eq!(issues[2].id, None);
        assert_eq!(issues[2].messages, vec!["_id is missing"]);
    }

    #[test]
    fn test_check_integrity_record_without_id_does_not_collide_with_itself() {
        let schema = Schema::new().field("email", FieldDescriptor::string().unique());
        let records = vec![record(json!({ "email": "c@test.com" }))];

        let issues = check_integrity(&schema, &records);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].messages, vec!["_id is missing"]);
    }

    #[test]
    fn test_check_integrity_flags_both_records_sharing_an_id() {
        let schema = Schema::new().field("email", FieldDescriptor::string().unique());
        let records = vec![
            record(json!({ "_id": "same", "email": "a@test.com" })),
            record(json!({ "_id": "same", "email": "a@test.com" })),
        ];

        let issues = check_integrity(&schema, &records);
        assert_eq!(issues.len(), 2);
        for issue in &issues {
            assert!(issue.messages.iter().any(|m| m.starts_with("email must be unique")));
        }
    }
}
