//! # Span lifecycle
//!
//! A span is started under a request [`Context`] with [`Tracing::start_span`],
//! annotated while the request runs, and ended exactly once with
//! [`end_span`]. [`SpanGuard`] ends it on drop instead.
use crate::provider::{ActiveBackend, Tracing};
use opentelemetry::{
    trace::{Status, TraceContextExt, Tracer},
    Context, KeyValue,
};
use std::borrow::Cow;
use std::error::Error;

impl Tracing {
    /// Start a span named `name` as a child of the span in `cx`, or of the
    /// remote parent attached by [`Tracing::inject_remote`].
    ///
    /// Returns a context carrying the new span. Never fails: a no-op handle
    /// yields a non-recording span that keeps the parent's identity.
    pub fn start_span<N, A>(&self, cx: &Context, name: N, attributes: A) -> Context
    where
        N: Into<Cow<'static, str>>,
        A: IntoIterator<Item = KeyValue>,
    {
        match &self.backend {
            ActiveBackend::Noop(tracer) => start_with(tracer, cx, name, attributes),
            ActiveBackend::Sdk { tracer, .. } => start_with(tracer, cx, name, attributes),
        }
    }

    /// Like [`start_span`](Tracing::start_span), but the span is ended when
    /// the returned guard is dropped.
    pub fn start_scoped<N, A>(&self, cx: &Context, name: N, attributes: A) -> SpanGuard
    where
        N: Into<Cow<'static, str>>,
        A: IntoIterator<Item = KeyValue>,
    {
        SpanGuard {
            cx: self.start_span(cx, name, attributes),
        }
    }
}

fn start_with<T, N, A>(tracer: &T, cx: &Context, name: N, attributes: A) -> Context
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    N: Into<Cow<'static, str>>,
    A: IntoIterator<Item = KeyValue>,
{
    let span = tracer
        .span_builder(name)
        .with_attributes(attributes)
        .start_with_context(tracer, cx);
    cx.with_span(span)
}

/// End the span in `cx`.
///
/// With `err`, an `exception` event is recorded and the status is set to
/// error with the error's message; otherwise the status is left unset. The
/// span must not be ended twice.
pub fn end_span(cx: &Context, err: Option<&dyn Error>) {
    if let Some(err) = err {
        record_failure(cx, err);
    }
    cx.span().end();
}

/// Add attributes to the span in `cx` before it ends.
pub fn set_attributes<A>(cx: &Context, attributes: A)
where
    A: IntoIterator<Item = KeyValue>,
{
    cx.span().set_attributes(attributes);
}

fn record_failure(cx: &Context, err: &dyn Error) {
    let span = cx.span();
    span.record_error(err);
    span.set_status(Status::error(err.to_string()));
}

/// Ends its span when dropped.
///
/// ```
/// use isupipe_trace::Tracing;
/// use opentelemetry::{Context, KeyValue};
///
/// let tracing = Tracing::noop();
/// let guard = tracing.start_scoped(
///     &Context::new(),
///     "postLivecommentHandler",
///     [KeyValue::new("livestream.id", 7)],
/// );
/// // pass guard.context() down to the database layer
/// # let _ = guard.context();
/// ```
#[derive(Debug)]
pub struct SpanGuard {
    cx: Context,
}

impl SpanGuard {
    /// Context carrying the guarded span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Mark the span as failed with `err`; it still ends on drop.
    pub fn fail(&self, err: &dyn Error) {
        record_failure(&self.cx, err);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.cx.span().end();
    }
}
