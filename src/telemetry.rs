use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Abstract tracer capability.
///
/// Only span lifecycle, attributes, events and opaque context tokens are
/// exposed; a no-op implementation must be substitutable without touching
/// any caller. Handles are threaded explicitly, never carried ambiently;
/// the opaque token is used only across the process boundary to the fuzz
/// engine and its upstream stages.
pub trait Tracer: Send + Sync {
    /// Start a new root span.
    fn span(&self, name: &str) -> Box<dyn Span>;

    /// Start a span parented to an exported context token. An empty or
    /// malformed token yields a root span.
    fn import(&self, token: &str, name: &str) -> Box<dyn Span>;
}

/// A live span. Ends when dropped.
pub trait Span: Send + Sync {
    fn child(&self, name: &str) -> Box<dyn Span>;
    fn set_attribute(&self, key: &str, value: &str);
    fn add_event(&self, name: &str);
    /// Export this span's context as an opaque token for cross-service links.
    fn export(&self) -> String;
}

/// Tracer that drops everything on the floor.
pub struct NoopTracer;

pub struct NoopSpan;

impl Tracer for NoopTracer {
    fn span(&self, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }

    fn import(&self, _token: &str, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

impl Span for NoopSpan {
    fn child(&self, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
    fn set_attribute(&self, _key: &str, _value: &str) {}
    fn add_event(&self, _name: &str) {}
    fn export(&self) -> String {
        String::new()
    }
}

#[derive(Serialize, Deserialize)]
struct SpanToken {
    trace_id: u64,
    span_id: u64,
}

/// Tracer that renders span lifecycle through the `tracing` log stream.
pub struct LogTracer {
    next_id: Arc<AtomicU64>,
}

impl LogTracer {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn start(&self, trace_id: u64, parent: Option<u64>, name: &str) -> Box<dyn Span> {
        let span_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(trace_id, span_id, parent, name, "span started");
        Box::new(LogSpan {
            trace_id,
            span_id,
            name: name.to_string(),
            next_id: self.next_id.clone(),
        })
    }
}

impl Default for LogTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for LogTracer {
    fn span(&self, name: &str) -> Box<dyn Span> {
        let trace_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.start(trace_id, None, name)
    }

    fn import(&self, token: &str, name: &str) -> Box<dyn Span> {
        match serde_json::from_str::<SpanToken>(token) {
            Ok(parsed) => self.start(parsed.trace_id, Some(parsed.span_id), name),
            Err(_) => self.span(name),
        }
    }
}

struct LogSpan {
    trace_id: u64,
    span_id: u64,
    name: String,
    next_id: Arc<AtomicU64>,
}

impl Span for LogSpan {
    fn child(&self, name: &str) -> Box<dyn Span> {
        let span_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            trace_id = self.trace_id,
            span_id,
            parent = self.span_id,
            name,
            "span started"
        );
        Box::new(LogSpan {
            trace_id: self.trace_id,
            span_id,
            name: name.to_string(),
            next_id: self.next_id.clone(),
        })
    }

    fn set_attribute(&self, key: &str, value: &str) {
        tracing::debug!(
            trace_id = self.trace_id,
            span_id = self.span_id,
            key,
            value,
            "span attribute"
        );
    }

    fn add_event(&self, name: &str) {
        tracing::debug!(
            trace_id = self.trace_id,
            span_id = self.span_id,
            event = name,
            "span event"
        );
    }

    fn export(&self) -> String {
        serde_json::to_string(&SpanToken {
            trace_id: self.trace_id,
            span_id: self.span_id,
        })
        .unwrap_or_default()
    }
}

impl Drop for LogSpan {
    fn drop(&mut self) {
        tracing::debug!(
            trace_id = self.trace_id,
            span_id = self.span_id,
            name = %self.name,
            "span ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tracer_token_round_trips() {
        let tracer = LogTracer::new();
        let span = tracer.span("root");
        let token = span.export();
        assert!(!token.is_empty());
        // importing a valid token must not panic and must produce a linked span
        let child = tracer.import(&token, "linked");
        assert!(!child.export().is_empty());
    }

    #[test]
    fn import_of_garbage_token_falls_back_to_root() {
        let tracer = LogTracer::new();
        let span = tracer.import("not json", "orphan");
        assert!(!span.export().is_empty());
    }

    #[test]
    fn noop_tracer_is_substitutable() {
        let tracer: Box<dyn Tracer> = Box::new(NoopTracer);
        let span = tracer.span("anything");
        span.set_attribute("k", "v");
        span.add_event("e");
        assert!(span.export().is_empty());
    }
}
