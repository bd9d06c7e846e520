use uuid::Uuid;

/// New session id: UUIDv7, time-sortable with a random suffix so insertion
/// order survives lexicographic sorting.
pub fn session_id() -> String {
    Uuid::now_v7().to_string()
}

/// New task id.
pub fn task_id() -> String {
    Uuid::new_v4().to_string()
}

/// New queued-chat entry id.
pub fn queue_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Per-process bearer secret for the loopback plugin endpoints.
pub fn plugin_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_sort_by_creation() {
        let a = session_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = session_id();
        assert!(a < b, "v7 ids must be time-ordered: {a} vs {b}");
    }

    #[test]
    fn plugin_secret_is_long_enough() {
        assert!(plugin_secret().len() >= 64);
    }
}
