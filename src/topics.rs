//! Topic scheme for the bridge.
//!
//! Every topic lives under the configured prefix:
//! - subscribe: `<p>status`, `<p>status/#`, `<p>destination/#`
//! - publish:   `<p>state/<name>` (liveness), `<p>info/<name>` (telemetry)

use crate::mqtt::Msg;

const TOPIC_STATUS: &str = "status";
const TOPIC_DESTINATION: &str = "destination";
const TOPIC_STATE: &str = "state";
const TOPIC_INFO: &str = "info";

/// Prefix-scoped topic builder/parser shared by the supervisor (subscriptions)
/// and the manager (dispatch and publishing).
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
}

impl TopicScheme {
    pub fn new(prefix: &str) -> Self {
        let mut prefix = prefix.to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    /// The three subscription filters the supervisor must establish.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}{}", self.prefix, TOPIC_STATUS),
            format!("{}{}/#", self.prefix, TOPIC_STATUS),
            format!("{}{}/#", self.prefix, TOPIC_DESTINATION),
        ]
    }

    /// Status query topic. `Some("")` is the all-destinations form,
    /// `Some(name)` a single destination, `None` not a status topic.
    pub fn parse_status(&self, topic: &str) -> Option<String> {
        if topic == format!("{}{}", self.prefix, TOPIC_STATUS) {
            return Some(String::new());
        }
        self.parse_suffix(topic, TOPIC_STATUS)
    }

    /// Destination config topic: `Some(name)` for `<p>destination/<name>`.
    pub fn parse_config(&self, topic: &str) -> Option<String> {
        self.parse_suffix(topic, TOPIC_DESTINATION)
    }

    /// Liveness topic: `Some(name)` for `<p>state/<name>`. Round-trips
    /// the topics produced by [`TopicScheme::state_message`].
    pub fn parse_state(&self, topic: &str) -> Option<String> {
        self.parse_suffix(topic, TOPIC_STATE)
    }

    fn parse_suffix(&self, topic: &str, family: &str) -> Option<String> {
        let head = format!("{}{}/", self.prefix, family);
        topic.strip_prefix(&head).map(|name| name.to_string())
    }

    pub fn state_topic(&self, name: &str) -> String {
        format!("{}{}/{}", self.prefix, TOPIC_STATE, name)
    }

    pub fn info_topic(&self, name: &str) -> String {
        format!("{}{}/{}", self.prefix, TOPIC_INFO, name)
    }

    /// Liveness advertisement: payload is `online`/`offline`.
    pub fn state_message(&self, name: &str, online: bool) -> Msg {
        Msg {
            topic: self.state_topic(name),
            payload: online_str(online).to_string(),
        }
    }

    /// Telemetry advertisement with an already-serialized JSON payload.
    pub fn info_message(&self, name: &str, info: String) -> Msg {
        Msg {
            topic: self.info_topic(name),
            payload: info,
        }
    }
}

pub fn online_str(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

/// First `n` characters of `s`, for payload log truncation.
pub fn first_n(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> TopicScheme {
        TopicScheme::new("pingrelay/")
    }

    #[test]
    fn test_subscriptions_from_prefix() {
        assert_eq!(
            scheme().subscriptions(),
            vec![
                "pingrelay/status".to_string(),
                "pingrelay/status/#".to_string(),
                "pingrelay/destination/#".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_trailing_slash_is_normalized() {
        let t = TopicScheme::new("home/net");
        assert_eq!(t.state_topic("router"), "home/net/state/router");
    }

    #[test]
    fn test_parse_status_topics() {
        let t = scheme();
        assert_eq!(t.parse_status("pingrelay/status"), Some(String::new()));
        assert_eq!(t.parse_status("pingrelay/status/router"), Some("router".to_string()));
        assert_eq!(t.parse_status("pingrelay/destination/router"), None);
        assert_eq!(t.parse_status("other/status"), None);
    }

    #[test]
    fn test_parse_config_topics() {
        let t = scheme();
        assert_eq!(t.parse_config("pingrelay/destination/router"), Some("router".to_string()));
        assert_eq!(t.parse_config("pingrelay/status/router"), None);
    }

    #[test]
    fn test_state_message_round_trip() {
        let t = scheme();
        let msg = t.state_message("router", true);
        assert_eq!(t.parse_state(&msg.topic), Some("router".to_string()));
        assert_eq!(msg.payload, "online");
        assert_eq!(t.state_message("router", false).payload, "offline");
    }

    #[test]
    fn test_broadcast_state_topic_matches_wildcard_filter() {
        // the topic advertised to users for subscribing to all liveness updates
        let t = scheme();
        assert_eq!(t.state_message("#", true).topic, "pingrelay/state/#");
        assert_eq!(t.info_message("#", String::new()).topic, "pingrelay/info/#");
    }

    #[test]
    fn test_first_n_respects_char_boundaries() {
        assert_eq!(first_n("héllo wörld", 4), "héll");
        assert_eq!(first_n("ab", 10), "ab");
    }
}
