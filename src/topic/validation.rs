//! Topic name and filter validation
//!
//! Rules from the MQTT v3.1.1 specification, section 4.7:
//! - topic names carry no wildcards
//! - `#` must occupy an entire level and may only be the final level
//! - `+` must occupy an entire level

/// Validate a topic filter as used in SUBSCRIBE/UNSUBSCRIBE
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > 65535 {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" || i != levels.len() - 1 {
                return false;
            }
        }
        if level.contains('+') && *level != "+" {
            return false;
        }
    }

    true
}

/// Validate a topic name as used in PUBLISH: non-empty, wildcard-free
pub fn valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= 65535 && !topic.contains('+') && !topic.contains('#')
}
