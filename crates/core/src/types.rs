/// Render jobs are identified by random v4 UUIDs.
pub type JobId = uuid::Uuid;

/// Session identifiers are opaque strings issued by the session registry.
pub type SessionId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
