//! Middleware chain primitives.
//!
//! A middleware sees every inbound envelope before any subscriber does and
//! decides, by returning a [`Flow`], whether processing continues.
//!
//! | Middleware | Purpose |
//! |---|---|
//! | [`LogMiddleware`] | Trace every envelope at a fixed level |
//! | [`TopicFilter`] | Drop envelopes whose topic is not allow-listed |
//! | closure `Fn(&str, Value) -> Result<Flow, LinkError>` | Arbitrary transformation |

use std::collections::HashSet;

use serde_json::Value;
use skylink_types::LinkError;
use tracing::Level;

/// Outcome of one middleware step.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Hand `data` (possibly rewritten) to the next step.
    Continue(Value),
    /// Consume the message: no further middleware, no dispatch, no retry.
    Halt,
}

/// One step of the bus's middleware chain.
///
/// Returning `Err` marks the whole dispatch as failed, which makes the bus
/// retry it.  Use [`Flow::Halt`] to drop a message on purpose.
pub trait Middleware: Send + Sync {
    fn process(&self, topic: &str, data: Value) -> Result<Flow, LinkError>;
}

impl<F> Middleware for F
where
    F: Fn(&str, Value) -> Result<Flow, LinkError> + Send + Sync,
{
    fn process(&self, topic: &str, data: Value) -> Result<Flow, LinkError> {
        self(topic, data)
    }
}

// ---------------------------------------------------------------------------
// LogMiddleware
// ---------------------------------------------------------------------------

/// Logs every envelope passing through the chain and lets it continue.
#[derive(Debug, Clone, Copy)]
pub struct LogMiddleware {
    level: Level,
}

impl LogMiddleware {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for LogMiddleware {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl Middleware for LogMiddleware {
    fn process(&self, topic: &str, data: Value) -> Result<Flow, LinkError> {
        log_envelope(self.level, "bus message", topic, &data);
        Ok(Flow::Continue(data))
    }
}

/// Emit one envelope record at a level chosen at runtime.
pub(crate) fn log_envelope(level: Level, message: &str, topic: &str, data: &Value) {
    match level {
        Level::ERROR => tracing::error!(topic, %data, "{message}"),
        Level::WARN => tracing::warn!(topic, %data, "{message}"),
        Level::INFO => tracing::info!(topic, %data, "{message}"),
        Level::DEBUG => tracing::debug!(topic, %data, "{message}"),
        _ => tracing::trace!(topic, %data, "{message}"),
    }
}

// ---------------------------------------------------------------------------
// TopicFilter
// ---------------------------------------------------------------------------

/// Validation step that halts envelopes outside an allow-list.
///
/// A topic passes when it equals one of the allowed topics or starts with
/// one of the allowed prefixes.
#[derive(Debug, Clone, Default)]
pub struct TopicFilter {
    topics: HashSet<String>,
    prefixes: Vec<String>,
}

impl TopicFilter {
    pub fn allow<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            prefixes: Vec::new(),
        }
    }

    /// Also accept every topic beginning with `prefix` (e.g. `"mount/"`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    pub fn permits(&self, topic: &str) -> bool {
        self.topics.contains(topic) || self.prefixes.iter().any(|p| topic.starts_with(p.as_str()))
    }
}

impl Middleware for TopicFilter {
    fn process(&self, topic: &str, data: Value) -> Result<Flow, LinkError> {
        if self.permits(topic) {
            Ok(Flow::Continue(data))
        } else {
            tracing::debug!(topic, "topic not allowed; message halted");
            Ok(Flow::Halt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn closures_are_middleware() {
        let upper = |_: &str, data: Value| -> Result<Flow, LinkError> {
            let text = data.as_str().unwrap_or_default().to_uppercase();
            Ok(Flow::Continue(Value::String(text)))
        };
        assert_eq!(
            upper.process("t", json!("slew")).unwrap(),
            Flow::Continue(json!("SLEW"))
        );
    }

    #[test]
    fn log_middleware_passes_data_through() {
        let data = json!({ "exposure": 2.5 });
        let flow = LogMiddleware::new(Level::DEBUG).process("camera/exposure", data.clone());
        assert_eq!(flow.unwrap(), Flow::Continue(data));
    }

    #[test]
    fn topic_filter_exact_and_prefix() {
        let filter = TopicFilter::allow(["settings"]).with_prefix("mount/");

        assert!(filter.permits("settings"));
        assert!(filter.permits("mount/slew"));
        assert!(!filter.permits("settings/extra"));
        assert!(!filter.permits("guider/start"));
    }

    #[test]
    fn topic_filter_halts_unknown_topics() {
        let filter = TopicFilter::allow(["mount/status"]);
        assert_eq!(filter.process("guider/start", json!(1)).unwrap(), Flow::Halt);
        assert_eq!(
            filter.process("mount/status", json!(1)).unwrap(),
            Flow::Continue(json!(1))
        );
    }

    #[test]
    fn empty_filter_halts_everything() {
        let filter = TopicFilter::default();
        assert_eq!(filter.process("anything", Value::Null).unwrap(), Flow::Halt);
    }
}
