//! Traced handling of a single incoming remote call.

use crate::request::{IncomingRequest, Tag};
use crate::sdk::{RemoteCallTracer, TracingSdk};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{info, warn};

pub const METHOD_NAME: &str = "myMethod";
pub const SERVICE_NAME: &str = "myService";
pub const SERVICE_ENDPOINT: &str = "endpoint";

/// Error returned by a message handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business logic invoked for the received message.
pub type MessageHandler = fn(&str) -> Result<(), HandlerError>;

/// A started span that is ended when dropped.
pub struct SpanGuard {
    tracer: Box<dyn RemoteCallTracer>,
}

impl SpanGuard {
    pub fn start(mut tracer: Box<dyn RemoteCallTracer>) -> Self {
        tracer.start();
        Self { tracer }
    }

    /// Mark the span as failed with `cause`.
    pub fn fail(&mut self, cause: &dyn std::error::Error) {
        self.tracer.error(cause);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.tracer.end();
    }
}

/// A handler panicked instead of returning an error.
#[derive(Debug)]
pub struct HandlerPanic(pub String);

impl fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler panicked: {}", self.0)
    }
}

impl std::error::Error for HandlerPanic {}

impl HandlerPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        HandlerPanic(message)
    }
}

/// Trace `request` and run `handler` on its message inside the span.
///
/// Failures of the handler, including panics, are recorded on the span and
/// logged; they never reach the caller.
pub fn trace_call<H>(sdk: &dyn TracingSdk, request: &IncomingRequest, handler: H)
where
    H: FnOnce(&str) -> Result<(), HandlerError>,
{
    let mut tracer = sdk.trace_incoming_remote_call(METHOD_NAME, SERVICE_NAME, SERVICE_ENDPOINT);
    match &request.tag {
        Tag::Text(tag) => tracer.set_string_tag(tag),
        Tag::Bytes(tag) => tracer.set_byte_tag(tag),
        Tag::Invalid(kind) => warn!(kind = *kind, "invalid tag received"),
    }

    let mut span = SpanGuard::start(tracer);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&request.message)))
        .unwrap_or_else(|payload| Err(HandlerPanic::from_payload(payload).into()));

    if let Err(e) = outcome {
        span.fail(&*e);
        warn!(error = %e, "handling of remote call failed");
    }
}

/// Placeholder for whatever the server does with a call.
pub fn handle_message(message: &str) -> Result<(), HandlerError> {
    info!("Received message from client: {}", message);
    Ok(())
}
