/// Length of a rendered identifier (hyphenated UUID form).
pub const ID_LENGTH: usize = 36;

/// Source of `_id` values for new records.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Random 128-bit identifiers rendered as hyphenated UUIDv4 strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
