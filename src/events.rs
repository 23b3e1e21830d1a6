//! Event Router: fan-out of server-pushed envelopes to topic listeners.
//!
//! Three kinds of filter are supported:
//!
//! - [`TopicFilter::Exact`] matches one literal topic
//! - [`TopicFilter::Any`] (`"*"`) matches every topic
//! - [`TopicFilter::Pattern`] matches a parameterized topic such as
//!   `changelog.{project_id}.progress` and hands the captured segments to the
//!   handler as [`Event::params`]
//!
//! Every matching listener runs once per event. A panicking handler is
//! logged and does not stop the others.
//!
//! ```ignore
//! let sub = router.on(TopicPattern::parse("changelog.{project_id}.progress")?, |event| {
//!     let project = &event.params["project_id"];
//!     log::info!("changelog progress for {project}: {}", event.payload);
//! });
//! // ...
//! sub.unsubscribe();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::listeners::{invoke_isolated, ListenerSet, Subscription};

/// Placeholder syntax inside topic templates: `{name}`.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([^{}]*)\}").expect("placeholder regex is valid")
});

/// Valid placeholder names.
static PARAM_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("name regex is valid")
});

/// A topic regex whose named capture groups become event parameters.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compile a template like `roadmap.{project_id}.progress`.
    ///
    /// Literal text matches exactly; each `{name}` matches one or more
    /// characters and is captured under `name`.
    pub fn parse(template: &str) -> Result<Self> {
        let mut pattern = String::from("^");
        let mut last = 0;
        let mut names = Vec::new();

        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let name = name.as_str();
            if !PARAM_NAME.is_match(name) {
                return Err(Error::InvalidPattern(format!(
                    "bad placeholder '{{{name}}}' in '{template}'"
                )));
            }
            if names.contains(&name) {
                return Err(Error::InvalidPattern(format!(
                    "duplicate placeholder '{{{name}}}' in '{template}'"
                )));
            }
            names.push(name);

            let literal = &template[last..whole.start()];
            check_literal(literal, template)?;
            pattern.push_str(&regex::escape(literal));
            pattern.push_str(&format!("(?P<{name}>.+)"));
            last = whole.end();
        }

        let tail = &template[last..];
        check_literal(tail, template)?;
        pattern.push_str(&regex::escape(tail));
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| Error::InvalidPattern(e.to_string()))?;
        Ok(Self {
            source: template.to_string(),
            regex,
        })
    }

    /// Use a hand-written regex; named groups become parameters.
    pub fn from_regex(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| Error::InvalidPattern(e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// The template or regex this pattern was built from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Captured parameters if `topic` matches.
    pub fn captures(&self, topic: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(topic)?;
        Some(
            self.regex
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.to_string(), m.as_str().to_string()))
                })
                .collect(),
        )
    }
}

/// Unbalanced braces outside placeholders are a template error.
fn check_literal(literal: &str, template: &str) -> Result<()> {
    if literal.contains(['{', '}']) {
        return Err(Error::InvalidPattern(format!(
            "unbalanced brace in '{template}'"
        )));
    }
    Ok(())
}

/// Which topics a listener receives.
#[derive(Debug, Clone)]
pub enum TopicFilter {
    /// Exactly this topic.
    Exact(String),
    /// Every topic.
    Any,
    /// Topics matching a pattern.
    Pattern(TopicPattern),
}

impl TopicFilter {
    /// Parameters if `topic` passes the filter.
    fn matches(&self, topic: &str) -> Option<HashMap<String, String>> {
        match self {
            Self::Exact(exact) => (exact == topic).then(HashMap::new),
            Self::Any => Some(HashMap::new()),
            Self::Pattern(pattern) => pattern.captures(topic),
        }
    }
}

impl From<&str> for TopicFilter {
    /// `"*"` becomes [`TopicFilter::Any`]; anything else is literal.
    fn from(topic: &str) -> Self {
        if topic == "*" {
            Self::Any
        } else {
            Self::Exact(topic.to_string())
        }
    }
}

impl From<String> for TopicFilter {
    fn from(topic: String) -> Self {
        Self::from(topic.as_str())
    }
}

impl From<TopicPattern> for TopicFilter {
    fn from(pattern: TopicPattern) -> Self {
        Self::Pattern(pattern)
    }
}

/// A pushed event as seen by a listener.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Literal topic string.
    pub topic: String,
    /// Event data.
    pub payload: Value,
    /// Segments captured by a pattern filter (empty otherwise).
    pub params: HashMap<String, String>,
}

type Handler = dyn Fn(&Event) + Send + Sync;

struct Route {
    filter: TopicFilter,
    handler: Box<Handler>,
}

/// Registry of topic listeners. Clones share the registry.
#[derive(Clone, Default)]
pub struct EventRouter {
    routes: ListenerSet<Route>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("listeners", &self.routes.len())
            .finish()
    }
}

impl EventRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for topics passing `filter`.
    pub fn on<F>(&self, filter: impl Into<TopicFilter>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.routes.add(Arc::new(Route {
            filter: filter.into(),
            handler: Box::new(handler),
        }))
    }

    /// Register a channel-backed listener for async consumers.
    pub fn stream(
        &self,
        filter: impl Into<TopicFilter>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.on(filter, move |event| {
            // A dropped receiver just means nobody is reading any more.
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.routes.len()
    }

    /// Deliver `topic`/`payload` to every matching listener.
    ///
    /// Returns how many listeners ran.
    pub fn dispatch(&self, topic: &str, payload: &Value) -> usize {
        let mut delivered = 0;
        for route in self.routes.snapshot() {
            let Some(params) = route.filter.matches(topic) else {
                continue;
            };
            let event = Event {
                topic: topic.to_string(),
                payload: payload.clone(),
                params,
            };
            invoke_isolated("Router", || (route.handler)(&event));
            delivered += 1;
        }
        if delivered == 0 {
            log::trace!("[Router] No listener for topic {}", topic);
        }
        delivered
    }

    /// Deliver an inbound envelope that was not claimed as a response.
    pub fn dispatch_envelope(&self, envelope: &Envelope) -> usize {
        self.dispatch(&envelope.topic, &envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_wildcard_sees_all_exact_sees_own_topic() {
        let router = EventRouter::new();
        let (wild, wild_handler) = counter();
        let (exact, exact_handler) = counter();
        let _w = router.on("*", wild_handler);
        let _e = router.on("foo", exact_handler);

        router.dispatch("foo", &json!({}));
        router.dispatch("bar", &json!({}));

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wild.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let router = EventRouter::new();
        let (count, handler) = counter();
        let sub = router.on("foo", handler);
        assert!(sub.unsubscribe());

        assert_eq!(router.dispatch("foo", &json!(null)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let router = EventRouter::new();
        let (count, handler) = counter();
        let _bad = router.on("foo", |_| panic!("handler failure"));
        let _good = router.on("foo", handler);

        assert_eq!(router.dispatch("foo", &json!(1)), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pattern_extracts_params() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let pattern = TopicPattern::parse("changelog.{project_id}.progress").unwrap();
        let _sub = router.on(pattern, move |event| {
            s.lock().push(event.params["project_id"].clone());
        });

        router.dispatch("changelog.p-42.progress", &json!({"pct": 10}));
        router.dispatch("changelog.p-42.complete", &json!({}));
        router.dispatch("roadmap.p-42.progress", &json!({}));

        assert_eq!(*seen.lock(), vec!["p-42".to_string()]);
    }

    #[test]
    fn test_pattern_escapes_literals() {
        let pattern = TopicPattern::parse("a.b").unwrap();
        assert!(pattern.captures("a.b").is_some());
        assert!(pattern.captures("axb").is_none());
    }

    #[test]
    fn test_pattern_with_two_params() {
        let pattern = TopicPattern::parse("task.{project_id}.{task_id}.log").unwrap();
        let params = pattern.captures("task.p1.t9.log").unwrap();
        assert_eq!(params["project_id"], "p1");
        assert_eq!(params["task_id"], "t9");
    }

    #[test]
    fn test_invalid_templates() {
        assert!(TopicPattern::parse("a.{1bad}").is_err());
        assert!(TopicPattern::parse("a.{x}.{x}").is_err());
        assert!(TopicPattern::parse("a.{x").is_err());
        assert!(TopicPattern::parse("a}.b").is_err());
        assert!(TopicPattern::from_regex("(unclosed").is_err());
    }

    #[test]
    fn test_raw_regex_named_groups() {
        let pattern = TopicPattern::from_regex(r"^insights\.(?P<session>[^.]+)\.chunk$").unwrap();
        let params = pattern.captures("insights.s1.chunk").unwrap();
        assert_eq!(params["session"], "s1");
    }

    #[test]
    fn test_string_star_is_wildcard() {
        assert!(matches!(TopicFilter::from("*"), TopicFilter::Any));
        assert!(matches!(TopicFilter::from("*foo"), TopicFilter::Exact(_)));
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let router = EventRouter::new();
        let (sub, mut rx) = router.stream("task.updated");
        router.dispatch("task.updated", &json!({"id": 1}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "task.updated");
        assert_eq!(event.payload["id"], 1);
        assert!(sub.unsubscribe());
    }

    #[test]
    fn test_handler_may_unsubscribe_during_dispatch() {
        let router = EventRouter::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (count, handler) = counter();
        let s = Arc::clone(&slot);
        let sub = router.on("once", move |event| {
            handler(event);
            if let Some(sub) = s.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        router.dispatch("once", &json!(null));
        router.dispatch("once", &json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
