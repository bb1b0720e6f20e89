//! # X-Cloud-Trace-Context header codec
//!
//! Pure conversions between header values and [`SpanContext`]s. The legacy
//! header is injected by Google Cloud load balancers and looks like
//!
//! `X-Cloud-Trace-Context: 105445aa7843bc8bf206b12000100000/1;o=1`
//!
//! where the first segment is the 128-bit trace id in hex, the second the
//! 64-bit span id in *decimal*, and the remainder the trace options.
//!
//! The standard [W3C TraceContext] form is delegated to the SDK's
//! [`TraceContextPropagator`].
//!
//! [W3C TraceContext]: https://www.w3.org/TR/trace-context/
use opentelemetry::{
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use thiserror::Error;

const TRACE_ID_HEX_LEN: usize = 32;
const TRACE_ID_DELIMITER: char = '/';
const SPAN_ID_DELIMITER: char = ';';
const OPTIONS_SAMPLED: &str = "o=1";
const OPTIONS_NOT_SAMPLED: &str = "o=0";

/// Errors returned when a legacy trace header cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    /// The trace id segment is missing, not 32 lowercase hex characters, or all zeros.
    #[error("malformed trace id {0:?}")]
    MalformedTraceId(String),

    /// The span id segment is missing or not an unsigned 64-bit decimal.
    #[error("malformed span id {0:?}")]
    MalformedSpanId(String),
}

/// Decode an `X-Cloud-Trace-Context` header value.
///
/// The returned context is remote and sampled. A span id of `0` is accepted
/// here but yields an invalid context, which propagators must not attach.
pub fn decode_legacy(header_value: &str) -> Result<SpanContext, DecodeError> {
    let header_value = header_value.trim();

    let (trace_hex, rest) = header_value
        .split_once(TRACE_ID_DELIMITER)
        .ok_or_else(|| DecodeError::MalformedTraceId(header_value.to_owned()))?;
    let trace_id = decode_trace_id(trace_hex)?;

    // everything after the first ';' is trace options and is not interpreted
    let (span_raw, _options) = rest
        .split_once(SPAN_ID_DELIMITER)
        .ok_or_else(|| DecodeError::MalformedSpanId(rest.to_owned()))?;
    let span_id = decode_span_id(span_raw)?;

    Ok(SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    ))
}

fn decode_trace_id(trace_hex: &str) -> Result<TraceId, DecodeError> {
    let malformed = || DecodeError::MalformedTraceId(trace_hex.to_owned());

    if trace_hex.len() != TRACE_ID_HEX_LEN
        || !trace_hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(malformed());
    }

    match TraceId::from_hex(trace_hex) {
        Ok(trace_id) if trace_id != TraceId::INVALID => Ok(trace_id),
        _ => Err(malformed()),
    }
}

fn decode_span_id(span_raw: &str) -> Result<SpanId, DecodeError> {
    // `u64::from_str` also accepts a leading '+', which the header format does not
    if span_raw.is_empty() || !span_raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::MalformedSpanId(span_raw.to_owned()));
    }

    span_raw
        .parse::<u64>()
        .map(|raw| SpanId::from_bytes(raw.to_be_bytes()))
        .map_err(|_| DecodeError::MalformedSpanId(span_raw.to_owned()))
}

/// Encode a span context as an `X-Cloud-Trace-Context` header value.
///
/// Returns `None` for invalid contexts.
pub fn encode_legacy(span_context: &SpanContext) -> Option<String> {
    if !span_context.is_valid() {
        return None;
    }

    let options = if span_context.is_sampled() {
        OPTIONS_SAMPLED
    } else {
        OPTIONS_NOT_SAMPLED
    };

    Some(format!(
        "{}{}{}{}{}",
        span_context.trace_id(),
        TRACE_ID_DELIMITER,
        u64::from_be_bytes(span_context.span_id().to_bytes()),
        SPAN_ID_DELIMITER,
        options,
    ))
}

/// Decode the W3C `traceparent`/`tracestate` headers.
///
/// Never fails; returns [`SpanContext::empty_context`] when the headers are
/// absent or malformed.
pub fn decode_standard(extractor: &dyn Extractor) -> SpanContext {
    TraceContextPropagator::new()
        .extract_with_context(&Context::new(), extractor)
        .span()
        .span_context()
        .clone()
}

/// Write the W3C `traceparent`/`tracestate` headers for a span context.
///
/// Nothing is written for invalid contexts.
pub fn encode_standard(span_context: &SpanContext, injector: &mut dyn Injector) {
    let cx = Context::new().with_remote_span_context(span_context.clone());
    TraceContextPropagator::new().inject_context(&cx, injector);
}
