//! Propagation of span contexts through the `X-Cloud-Trace-Context` header.
//!
//! Google Cloud load balancers inject `X-Cloud-Trace-Context` into every
//! request they forward, while services talking to each other usually speak
//! W3C `traceparent`. This crate provides:
//!
//! * [`codec`]: pure functions decoding and encoding both header forms.
//! * [`CloudTraceContextPropagator`]: a [`TextMapPropagator`] for the legacy
//!   header, usable anywhere an OpenTelemetry propagator is expected.
//!
//! ### Quick start
//!
//! ```
//! use opentelemetry::global;
//! use opentelemetry_cloud_trace_propagator::CloudTraceContextPropagator;
//!
//! global::set_text_map_propagator(CloudTraceContextPropagator::new());
//! ```
//!
//! [`TextMapPropagator`]: opentelemetry::propagation::TextMapPropagator
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

pub mod codec;
mod propagator;

pub use codec::DecodeError;
pub use propagator::{CloudTraceContextPropagator, CLOUD_TRACE_CONTEXT_HEADER};
