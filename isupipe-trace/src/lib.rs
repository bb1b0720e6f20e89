//! Distributed tracing for the isupipe web backend.
//!
//! Request handlers depend on five operations:
//!
//! * [`init_provider`]: build the [`Tracing`] handle once at startup.
//! * [`Tracing::inject_remote`]: attach the trace context of an inbound
//!   request to a [`Context`](opentelemetry::Context).
//! * [`Tracing::extract_trace_id`]: the trace id of an inbound request.
//! * [`Tracing::start_span`] and [`end_span`]: open and close a span.
//!
//! None of these fail the request. Decode errors leave the context without a
//! remote parent, and a handle whose backend could not be built records
//! nothing.
//!
//! ### Quick start
//!
//! ```no_run
//! use isupipe_trace::{end_span, init_provider, TraceConfig, Tracing};
//! use opentelemetry::{Context, KeyValue};
//! use std::collections::HashMap;
//!
//! let config = TraceConfig::from_env();
//! let tracing = init_provider(&config).unwrap_or_else(|err| {
//!     eprintln!("tracing disabled: {err}");
//!     Tracing::noop()
//! });
//!
//! // per request
//! let headers: HashMap<String, String> = HashMap::new();
//! let cx = tracing.inject_remote(&Context::new(), &headers);
//! let cx = tracing.start_span(&cx, "getUserHandler", [KeyValue::new("user.name", "alice")]);
//! end_span(&cx, None);
//!
//! // at exit
//! if let Err(err) = tracing.shutdown() {
//!     eprintln!("{err}");
//! }
//! ```
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

pub mod config;
mod error;
mod propagation;
mod provider;
mod span;

pub use config::{Backend, TraceConfig};
pub use error::{ConfigError, FlushError, InitError};
pub use propagation::Propagation;
pub use provider::{init_provider, InitFailurePolicy, Tracing, INSTRUMENTATION_SCOPE};
pub use span::{end_span, set_attributes, SpanGuard};
