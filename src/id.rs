use ulid::Ulid;

/// Identifier for a written batch; sortable by creation time.
pub fn new_batch_id() -> String {
    Ulid::new().to_string()
}
