use crate::codec::{decode_legacy, encode_legacy};
use opentelemetry::{
    otel_debug,
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, TraceContextExt},
    Context,
};
use std::sync::OnceLock;

/// Header name, lower case so it matches both `http::HeaderMap` and
/// `HashMap` extractors.
pub const CLOUD_TRACE_CONTEXT_HEADER: &str = "x-cloud-trace-context";

static CLOUD_TRACE_CONTEXT_HEADER_FIELDS: OnceLock<[String; 1]> = OnceLock::new();

fn cloud_trace_context_header_fields() -> &'static [String; 1] {
    CLOUD_TRACE_CONTEXT_HEADER_FIELDS.get_or_init(|| [CLOUD_TRACE_CONTEXT_HEADER.to_owned()])
}

/// Extracts and injects `SpanContext`s using the `X-Cloud-Trace-Context` header.
///
/// Only valid span contexts are ever attached. A missing or malformed header
/// leaves the context untouched, so spans started under it become new roots.
///
/// ## Example
///
/// ```
/// use opentelemetry::{propagation::TextMapPropagator, trace::TraceContextExt};
/// use opentelemetry_cloud_trace_propagator::CloudTraceContextPropagator;
/// use std::collections::HashMap;
///
/// let mut headers = HashMap::new();
/// headers.insert(
///     "x-cloud-trace-context".to_string(),
///     "105445aa7843bc8bf206b12000100000/1;o=1".to_string(),
/// );
///
/// let cx = CloudTraceContextPropagator::new().extract(&headers);
/// assert_eq!(
///     cx.span().span_context().trace_id().to_string(),
///     "105445aa7843bc8bf206b12000100000"
/// );
/// ```
#[derive(Clone, Debug, Default)]
pub struct CloudTraceContextPropagator {
    _private: (),
}

impl CloudTraceContextPropagator {
    /// Create a new `CloudTraceContextPropagator`.
    pub fn new() -> Self {
        CloudTraceContextPropagator::default()
    }

    /// Decode the header carried by `extractor`, if any.
    ///
    /// Returns `None` when the header is absent, malformed, or decodes to an
    /// invalid span context.
    pub fn extract_span_context(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let header_value = extractor.get(CLOUD_TRACE_CONTEXT_HEADER)?;

        match decode_legacy(header_value) {
            Ok(span_context) if span_context.is_valid() => Some(span_context),
            Ok(_) => {
                otel_debug!(
                    name: "CloudTraceContextPropagator.InvalidSpanContext",
                    header = header_value.to_owned()
                );
                None
            }
            Err(err) => {
                otel_debug!(
                    name: "CloudTraceContextPropagator.ExtractFailed",
                    error = format!("{err}")
                );
                None
            }
        }
    }
}

impl TextMapPropagator for CloudTraceContextPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        if let Some(header_value) = encode_legacy(span.span_context()) {
            injector.set(CLOUD_TRACE_CONTEXT_HEADER, header_value);
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.extract_span_context(extractor)
            .map(|sc| cx.with_remote_span_context(sc))
            .unwrap_or_else(|| cx.clone())
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(cloud_trace_context_header_fields())
    }
}
