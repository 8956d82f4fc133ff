//! Tracing collaborator used to record incoming remote calls.
//!
//! The server only talks to the traits in this module. `SpanSdk` is the
//! implementation shipped with the binary: every remote call becomes a
//! `tracing` span carrying the call's identity, its correlation tag and its
//! outcome, so any subscriber or exporter layered onto `tracing` sees it.

use std::time::Instant;
use tracing::field::Empty;
use tracing::span::EnteredSpan;
use tracing::{debug, info_span, Span};

/// Whether the collaborator is able to capture calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)] // TemporarilyInactive and Unknown are reported by other collaborators
pub enum SdkState {
    Active,
    PermanentlyInactive,
    TemporarilyInactive,
    Unknown,
}

/// One traced incoming call.
///
/// Callers set at most one tag, then `start`, optionally `error`, then
/// `end`. Calling `end` more than once has no further effect.
pub trait RemoteCallTracer {
    fn set_string_tag(&mut self, tag: &str);
    fn set_byte_tag(&mut self, tag: &[u8]);
    fn start(&mut self);
    fn error(&mut self, cause: &dyn std::error::Error);
    fn end(&mut self);
}

/// Handle to the tracing collaborator.
pub trait TracingSdk {
    fn current_state(&self) -> SdkState;

    fn trace_incoming_remote_call(
        &self,
        method: &str,
        service: &str,
        endpoint: &str,
    ) -> Box<dyn RemoteCallTracer>;
}

/// Collaborator backed by `tracing` spans.
#[derive(Debug, Clone)]
pub struct SpanSdk {
    enabled: bool,
}

impl SpanSdk {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl TracingSdk for SpanSdk {
    fn current_state(&self) -> SdkState {
        if self.enabled {
            SdkState::Active
        } else {
            SdkState::PermanentlyInactive
        }
    }

    fn trace_incoming_remote_call(
        &self,
        method: &str,
        service: &str,
        endpoint: &str,
    ) -> Box<dyn RemoteCallTracer> {
        if !self.enabled {
            return Box::new(NoopTracer);
        }

        let span = info_span!(
            "incoming_remote_call",
            method = %method,
            service = %service,
            endpoint = %endpoint,
            tag = Empty,
            status = Empty,
            error.message = Empty,
            elapsed_ms = Empty,
        );
        Box::new(SpanTracer {
            span,
            entered: None,
            started_at: None,
            failed: false,
            ended: false,
        })
    }
}

struct SpanTracer {
    span: Span,
    entered: Option<EnteredSpan>,
    started_at: Option<Instant>,
    failed: bool,
    ended: bool,
}

impl RemoteCallTracer for SpanTracer {
    fn set_string_tag(&mut self, tag: &str) {
        self.span.record("tag", tag);
    }

    fn set_byte_tag(&mut self, tag: &[u8]) {
        let hex: String = tag.iter().map(|b| format!("{b:02x}")).collect();
        self.span.record("tag", hex.as_str());
    }

    fn start(&mut self) {
        if self.started_at.is_some() || self.ended {
            return;
        }
        self.started_at = Some(Instant::now());
        self.entered = Some(self.span.clone().entered());
        debug!("remote call span started");
    }

    fn error(&mut self, cause: &dyn std::error::Error) {
        self.failed = true;
        self.span.record("error.message", cause.to_string().as_str());
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        let status = if self.failed { "error" } else { "ok" };
        self.span.record("status", status);
        if let Some(started_at) = self.started_at {
            self.span
                .record("elapsed_ms", started_at.elapsed().as_secs_f64() * 1000.0);
        }
        debug!(status, "remote call span ended");
        self.entered.take();
    }
}

/// Tracer handed out while the collaborator is inactive.
struct NoopTracer;

impl RemoteCallTracer for NoopTracer {
    fn set_string_tag(&mut self, _tag: &str) {}
    fn set_byte_tag(&mut self, _tag: &[u8]) {}
    fn start(&mut self) {}
    fn error(&mut self, _cause: &dyn std::error::Error) {}
    fn end(&mut self) {}
}

/// In-memory collaborator that records every call made on its tracers.
#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct RecordedSpan {
        pub method: String,
        pub service: String,
        pub endpoint: String,
        pub string_tag: Option<String>,
        pub byte_tag: Option<Vec<u8>>,
        pub started: bool,
        pub error: Option<String>,
        pub end_calls: usize,
    }

    #[derive(Debug, Clone, Default)]
    pub struct RecordingSdk {
        spans: Arc<Mutex<Vec<RecordedSpan>>>,
    }

    impl RecordingSdk {
        pub fn spans(&self) -> Vec<RecordedSpan> {
            self.spans.lock().unwrap().clone()
        }
    }

    impl TracingSdk for RecordingSdk {
        fn current_state(&self) -> SdkState {
            SdkState::Active
        }

        fn trace_incoming_remote_call(
            &self,
            method: &str,
            service: &str,
            endpoint: &str,
        ) -> Box<dyn RemoteCallTracer> {
            let mut spans = self.spans.lock().unwrap();
            spans.push(RecordedSpan {
                method: method.to_string(),
                service: service.to_string(),
                endpoint: endpoint.to_string(),
                ..Default::default()
            });
            Box::new(RecordingTracer {
                spans: Arc::clone(&self.spans),
                index: spans.len() - 1,
            })
        }
    }

    struct RecordingTracer {
        spans: Arc<Mutex<Vec<RecordedSpan>>>,
        index: usize,
    }

    impl RecordingTracer {
        fn with_span(&self, f: impl FnOnce(&mut RecordedSpan)) {
            f(&mut self.spans.lock().unwrap()[self.index]);
        }
    }

    impl RemoteCallTracer for RecordingTracer {
        fn set_string_tag(&mut self, tag: &str) {
            self.with_span(|s| s.string_tag = Some(tag.to_string()));
        }

        fn set_byte_tag(&mut self, tag: &[u8]) {
            self.with_span(|s| s.byte_tag = Some(tag.to_vec()));
        }

        fn start(&mut self) {
            self.with_span(|s| s.started = true);
        }

        fn error(&mut self, cause: &dyn std::error::Error) {
            self.with_span(|s| s.error = Some(cause.to_string()));
        }

        fn end(&mut self) {
            self.with_span(|s| s.end_calls += 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_state_follows_enabled_flag() {
        assert_eq!(SpanSdk::new(true).current_state(), SdkState::Active);
        assert_eq!(
            SpanSdk::new(false).current_state(),
            SdkState::PermanentlyInactive
        );
    }

    #[test]
    fn test_span_tracer_lifecycle() {
        let sdk = SpanSdk::new(true);
        let mut tracer = sdk.trace_incoming_remote_call("myMethod", "myService", "endpoint");
        tracer.set_byte_tag(&[0xde, 0xad]);
        tracer.start();
        tracer.error(&Boom);
        tracer.end();
        tracer.end();
    }

    #[test]
    fn test_span_tracer_exits_span_on_end() {
        let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry());

        let sdk = SpanSdk::new(true);
        let mut tracer = sdk.trace_incoming_remote_call("myMethod", "myService", "endpoint");
        tracer.start();
        assert_eq!(
            Span::current().metadata().map(|m| m.name()),
            Some("incoming_remote_call")
        );
        tracer.end();
        assert!(Span::current().is_none());
    }

    #[test]
    fn test_disabled_sdk_hands_out_noop_tracers() {
        let sdk = SpanSdk::new(false);
        let mut tracer = sdk.trace_incoming_remote_call("myMethod", "myService", "endpoint");
        tracer.set_string_tag("abc");
        tracer.start();
        tracer.end();
    }
}
