//! Downlink dispatch table
//!
//! Maps topic-suffix patterns to handlers. The table is built once when an
//! orchestrator is constructed and never changes afterwards; routes are tried
//! in registration order and the first match wins.

use std::fmt;
use std::sync::Arc;

use super::topic::PlatformTopic;

/// A message delivered on a platform topic
#[derive(Debug, Clone)]
pub struct Downlink {
    /// Parsed topic
    pub topic: PlatformTopic,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl Downlink {
    /// Request id carried by the topic
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.topic.request_id.as_deref()
    }
}

/// Handler invoked on the downlink task; must not block
pub type Handler = Arc<dyn Fn(Downlink) + Send + Sync>;

/// Outcome of matching a topic against the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    /// Index of the matching route
    pub route: usize,
    /// Pattern that matched
    pub pattern: String,
    /// Whether the topic carried a `request_id=` suffix
    pub has_request_id: bool,
}

struct Route {
    pattern: String,
    handler: Handler,
}

/// Ordered topic-suffix → handler table
#[derive(Default)]
pub struct DispatchTable {
    routes: Vec<Route>,
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| &r.pattern))
            .finish()
    }
}

impl DispatchTable {
    /// Start building a table
    #[must_use]
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// Patterns in match order
    #[must_use]
    pub fn patterns(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.pattern.as_str()).collect()
    }

    /// Find the first route matching a parsed topic
    #[must_use]
    pub fn resolve(&self, topic: &PlatformTopic) -> Option<TopicMatch> {
        self.routes
            .iter()
            .position(|r| suffix_matches(&r.pattern, &topic.suffix))
            .map(|route| TopicMatch {
                route,
                pattern: self.routes[route].pattern.clone(),
                has_request_id: topic.request_id.is_some(),
            })
    }

    /// Route a raw topic and payload to its handler
    ///
    /// Returns the match, or `None` when the topic is foreign or unrouted.
    pub fn dispatch(&self, topic: &str, payload: Vec<u8>) -> Option<TopicMatch> {
        let Some(parsed) = PlatformTopic::parse(topic) else {
            tracing::debug!(topic, "ignoring non-platform topic");
            return None;
        };

        let Some(matched) = self.resolve(&parsed) else {
            tracing::debug!(topic, "no handler for topic");
            return None;
        };

        tracing::debug!(
            topic,
            pattern = %matched.pattern,
            has_request_id = matched.has_request_id,
            "dispatching downlink"
        );
        (self.routes[matched.route].handler)(Downlink {
            topic: parsed,
            payload,
        });
        Some(matched)
    }
}

/// `pattern` matches `suffix` exactly or as a leading path segment
fn suffix_matches(pattern: &str, suffix: &str) -> bool {
    suffix
        .strip_prefix(pattern)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Builder for [`DispatchTable`]
#[derive(Default)]
pub struct DispatchTableBuilder {
    routes: Vec<Route>,
}

impl DispatchTableBuilder {
    /// Add a route; earlier routes take precedence
    #[must_use]
    pub fn on<F>(mut self, pattern: &str, handler: F) -> Self
    where
        F: Fn(Downlink) + Send + Sync + 'static,
    {
        self.routes.push(Route {
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Freeze the table
    #[must_use]
    pub fn build(self) -> DispatchTable {
        DispatchTable {
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::topic::{COMMANDS, EVENTS_DOWN, SHADOW_GET, SHADOW_GET_RESPONSE};

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(Downlink) + use<> {
        let log = Arc::clone(log);
        move |d: Downlink| {
            log.lock()
                .unwrap()
                .push(format!("{tag}:{}", d.request_id().unwrap_or("-")));
        }
    }

    #[test]
    fn first_registered_match_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let table = DispatchTable::builder()
            .on(SHADOW_GET_RESPONSE, recording(&log, "shadow-response"))
            .on(SHADOW_GET, recording(&log, "shadow-any"))
            .build();

        let matched = table
            .dispatch("$oc/devices/d/sys/shadow/get/response/request_id=7", Vec::new())
            .unwrap();
        assert_eq!(matched.route, 0);
        assert!(matched.has_request_id);
        assert_eq!(*log.lock().unwrap(), vec!["shadow-response:7"]);
    }

    #[test]
    fn broader_pattern_registered_first_shadows_narrower() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let table = DispatchTable::builder()
            .on(SHADOW_GET, recording(&log, "shadow-any"))
            .on(SHADOW_GET_RESPONSE, recording(&log, "shadow-response"))
            .build();

        table.dispatch("$oc/devices/d/sys/shadow/get/response/request_id=7", Vec::new());
        assert_eq!(*log.lock().unwrap(), vec!["shadow-any:7"]);
    }

    #[test]
    fn reports_missing_request_id() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let table = DispatchTable::builder()
            .on(EVENTS_DOWN, recording(&log, "events"))
            .build();

        let matched = table.dispatch("$oc/devices/gw/sys/events/down", Vec::new()).unwrap();
        assert!(!matched.has_request_id);
        assert_eq!(*log.lock().unwrap(), vec!["events:-"]);
    }

    #[test]
    fn pattern_must_end_on_segment_boundary() {
        let table = DispatchTable::builder().on(COMMANDS, |_| {}).build();

        assert!(table.dispatch("$oc/devices/d/sys/commandsX", Vec::new()).is_none());
        assert!(table.dispatch("$oc/devices/d/sys/commands/request_id=1", Vec::new()).is_some());
    }

    #[test]
    fn foreign_and_unrouted_topics_are_ignored() {
        let table = DispatchTable::builder().on(COMMANDS, |_| {}).build();

        assert!(table.dispatch("sensors/temp", Vec::new()).is_none());
        assert!(table.dispatch("$oc/devices/d/sys/messages/down", Vec::new()).is_none());
        assert_eq!(table.patterns(), vec![COMMANDS]);
    }
}
