/// Unique task identifier. Generated as a UUID v4 at task creation, so
/// collisions are cryptographically negligible for the lifetime of a store.
pub type TaskId = uuid::Uuid;

/// UTC timestamp type used across the workspace.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
