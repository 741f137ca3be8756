/// Job identifiers are opaque strings assigned exactly once by admission.
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh, time-ordered job identifier.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7().to_string()
}
