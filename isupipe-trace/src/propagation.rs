//! # Inbound and outbound trace context
//!
//! A deployment sits either behind a Google Cloud load balancer, which injects
//! `X-Cloud-Trace-Context` into every request, or behind services speaking W3C
//! `traceparent`. [`Propagation`] selects one of the two dialects once at
//! startup; everything else goes through it.
use crate::config::PROPAGATION;
use crate::error::ConfigError;
use opentelemetry::{
    otel_debug,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, TraceContextExt},
    Context,
};
use opentelemetry_cloud_trace_propagator::{codec, CloudTraceContextPropagator};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Header dialect used to carry trace context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Propagation {
    /// `X-Cloud-Trace-Context: <trace-id-hex>/<span-id-decimal>;o=<options>`
    #[default]
    CloudTraceContext,
    /// W3C `traceparent` and `tracestate`.
    TraceContext,
}

impl Propagation {
    /// Value accepted by [`PROPAGATION`] for this dialect.
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::CloudTraceContext => "cloud_trace_context",
            Propagation::TraceContext => "tracecontext",
        }
    }

    /// Decode the remote span context carried by `extractor`.
    ///
    /// Returns `None` when no header of this dialect is present or when it
    /// does not decode to a valid span context.
    pub fn extract_span_context(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        match self {
            Propagation::CloudTraceContext => {
                CloudTraceContextPropagator::new().extract_span_context(extractor)
            }
            Propagation::TraceContext => {
                let span_context = codec::decode_standard(extractor);
                if span_context.is_valid() {
                    Some(span_context)
                } else {
                    otel_debug!(
                        name: "Propagation.NoRemoteParent",
                        propagation = self.as_str()
                    );
                    None
                }
            }
        }
    }

    /// Attach the remote span context found in `extractor` to `cx`.
    ///
    /// When the header is absent or malformed `cx` is returned unchanged, so
    /// the next span started under it becomes a new root.
    pub fn inject_remote(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        match self.extract_span_context(extractor) {
            Some(span_context) => cx.with_remote_span_context(span_context),
            None => cx.clone(),
        }
    }

    /// The 32 character hex trace id carried by `extractor`, or an empty
    /// string when there is none.
    pub fn extract_trace_id(&self, extractor: &dyn Extractor) -> String {
        self.extract_span_context(extractor)
            .map(|span_context| span_context.trace_id().to_string())
            .unwrap_or_default()
    }

    /// Write the active span of `cx` into `injector` for an outbound call.
    ///
    /// Nothing is written when `cx` has no valid span.
    pub fn inject(&self, cx: &Context, injector: &mut dyn Injector) {
        match self {
            Propagation::CloudTraceContext => {
                CloudTraceContextPropagator::new().inject_context(cx, injector)
            }
            Propagation::TraceContext => codec::encode_standard(cx.span().span_context(), injector),
        }
    }
}

impl Display for Propagation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud_trace_context" => Ok(Propagation::CloudTraceContext),
            "tracecontext" => Ok(Propagation::TraceContext),
            _ => Err(ConfigError::UnknownValue {
                option: PROPAGATION,
                value: s.to_owned(),
            }),
        }
    }
}
