//! MQTT topic 过滤器匹配（`+` 单级、`#` 多级）。

/// 判断 `topic` 是否匹配订阅过滤器 `filter`。
///
/// `#` 同时匹配父级本身（`a/#` 匹配 `a`）；以 `$` 开头的系统 topic 不会被
/// 首级通配符匹配。
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn exact_levels() {
        assert!(topic_matches("/sensor/dht/data", "/sensor/dht/data"));
        assert!(!topic_matches("/sensor/dht/data", "/sensor/dht/status"));
        assert!(!topic_matches("/sensor/dht/data", "/sensor/dht/data/extra"));
        assert!(!topic_matches("/sensor/dht/data", "/sensor/dht"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("/sensor/+/data", "/sensor/dht/data"));
        assert!(topic_matches("/sensor/+/data", "/sensor/bme/data"));
        assert!(!topic_matches("/sensor/+/data", "/sensor/dht/x/data"));
        assert!(topic_matches("+/+", "/finance"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("/sensor/#", "/sensor/dht/data"));
        assert!(topic_matches("/sensor/#", "/sensor"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("/sensor/#", "/actuator/relay"));
    }

    #[test]
    fn system_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }
}
