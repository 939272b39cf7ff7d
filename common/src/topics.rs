pub const TOPIC_ROOT: &str = "fota";

pub fn status_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/status")
}

pub fn availability_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/availability")
}
