use chrono::Utc;

pub struct DbrbTime;

impl DbrbTime {
    /// Milliseconds since the Unix epoch.
    pub fn now() -> u64 {
        Utc::now().timestamp_millis() as u64
    }
}
