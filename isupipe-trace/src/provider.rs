//! # Tracer provider lifecycle
//!
//! [`init_provider`] runs once at startup and returns a [`Tracing`] handle.
//! The handle is cloned into every request flow; clones share the same
//! provider and nothing is written to it after construction.
//!
//! Backends fail differently on construction, as listed by
//! [`Backend::init_failure_policy`]:
//!
//! | Backend | On exporter failure |
//! |---|---|
//! | `jaeger` | fall back to a no-op handle |
//! | `cloud_trace` | return [`InitError::ExporterInitFailure`] |
//! | `none` | no policy, building nothing cannot fail |
use crate::config::{Backend, TraceConfig, DEFAULT_FLUSH_TIMEOUT};
use crate::error::{FlushError, InitError};
use crate::propagation::Propagation;
use opentelemetry::{
    global, otel_info, otel_warn,
    propagation::{Extractor, Injector, TextMapCompositePropagator},
    trace::{
        noop::{NoopTracer, NoopTracerProvider},
        TracerProvider as _,
    },
    Context, InstrumentationScope, KeyValue,
};
use opentelemetry_cloud_trace_propagator::CloudTraceContextPropagator;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{
    error::OTelSdkResult,
    propagation::TraceContextPropagator,
    trace::{BatchSpanProcessor, Sampler, SdkTracer, SdkTracerProvider, SpanExporter},
    Resource,
};
use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Instrumentation scope name of the spans started through [`Tracing`].
pub const INSTRUMENTATION_SCOPE: &str = "isupipe-trace";

const ENVIRONMENT_KEY: &str = "environment";
const VERSION_KEY: &str = "version";
const GCP_PROJECT_ID_KEY: &str = "gcp.project_id";
const GOOG_USER_PROJECT_HEADER: &str = "x-goog-user-project";

/// What [`init_provider`] does when a backend's exporter cannot be built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitFailurePolicy {
    /// Log the failure and continue with a no-op handle.
    Fallback,
    /// Return the failure to the caller.
    Propagate,
}

impl Backend {
    /// Failure policy applied by [`init_provider`] for this backend.
    ///
    /// `None` for [`Backend::None`], which builds no exporter.
    pub fn init_failure_policy(&self) -> Option<InitFailurePolicy> {
        match self {
            Backend::Jaeger => Some(InitFailurePolicy::Fallback),
            Backend::CloudTrace => Some(InitFailurePolicy::Propagate),
            Backend::None => None,
        }
    }
}

/// Handle to the active tracer provider and propagation dialect.
///
/// Cheap to clone. The default handle is a no-op: spans started through it
/// are not recorded but still carry their parent's identity, so it is safe
/// to use before or without [`init_provider`].
#[derive(Clone, Debug)]
pub struct Tracing {
    pub(crate) backend: ActiveBackend,
    propagation: Propagation,
    flush_timeout: Duration,
}

#[derive(Clone, Debug)]
pub(crate) enum ActiveBackend {
    Noop(NoopTracer),
    Sdk {
        provider: SdkTracerProvider,
        tracer: SdkTracer,
    },
}

impl Default for Tracing {
    fn default() -> Self {
        Tracing::noop()
    }
}

impl Tracing {
    /// A handle that records nothing.
    pub fn noop() -> Self {
        Tracing {
            backend: ActiveBackend::Noop(NoopTracer::new()),
            propagation: Propagation::default(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    fn noop_with(config: &TraceConfig) -> Self {
        Tracing {
            propagation: config.propagation,
            flush_timeout: config.flush_timeout,
            ..Tracing::noop()
        }
    }

    /// Build a recording handle around `exporter`.
    ///
    /// Finished spans are batched on a background thread and every span is
    /// sampled. The resource is derived from `config`.
    pub fn with_exporter<E>(exporter: E, config: &TraceConfig) -> Self
    where
        E: SpanExporter + 'static,
    {
        let provider = SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter).build())
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource(config))
            .build();
        let scope = InstrumentationScope::builder(INSTRUMENTATION_SCOPE)
            .with_version(env!("CARGO_PKG_VERSION"))
            .build();
        let tracer = provider.tracer_with_scope(scope);

        Tracing {
            backend: ActiveBackend::Sdk { provider, tracer },
            propagation: config.propagation,
            flush_timeout: config.flush_timeout,
        }
    }

    /// Whether spans started through this handle are dropped.
    pub fn is_noop(&self) -> bool {
        matches!(self.backend, ActiveBackend::Noop(_))
    }

    /// Header dialect used by [`inject_remote`](Tracing::inject_remote) and
    /// [`extract_trace_id`](Tracing::extract_trace_id).
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// See [`Propagation::inject_remote`].
    pub fn inject_remote(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.propagation.inject_remote(cx, extractor)
    }

    /// See [`Propagation::extract_trace_id`].
    pub fn extract_trace_id(&self, extractor: &dyn Extractor) -> String {
        self.propagation.extract_trace_id(extractor)
    }

    /// See [`Propagation::inject`].
    pub fn inject(&self, cx: &Context, injector: &mut dyn Injector) {
        self.propagation.inject(cx, injector)
    }

    /// Install this handle's provider as the process-wide OpenTelemetry
    /// tracer provider, for libraries that only read the globals.
    ///
    /// The process-wide propagator is the W3C `traceparent` propagator,
    /// composed with the `X-Cloud-Trace-Context` one, whatever this handle's
    /// [`Propagation`] is.
    pub fn install_global(&self) {
        match &self.backend {
            ActiveBackend::Noop(_) => {
                global::set_tracer_provider(NoopTracerProvider::new());
            }
            ActiveBackend::Sdk { provider, .. } => {
                global::set_tracer_provider(provider.clone());
            }
        }

        global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(CloudTraceContextPropagator::new()),
        ]));
    }

    /// Export every span ended so far.
    ///
    /// Waits at most the configured flush timeout.
    pub fn force_flush(&self) -> Result<(), FlushError> {
        match &self.backend {
            ActiveBackend::Noop(_) => Ok(()),
            ActiveBackend::Sdk { provider, .. } => {
                self.bounded(provider, |provider| provider.force_flush())
            }
        }
    }

    /// Flush buffered spans and stop the exporter.
    ///
    /// Waits at most the configured flush timeout; spans still buffered
    /// after that are dropped. Call once, when the process is terminating.
    pub fn shutdown(&self) -> Result<(), FlushError> {
        match &self.backend {
            ActiveBackend::Noop(_) => Ok(()),
            ActiveBackend::Sdk { provider, .. } => {
                self.bounded(provider, |provider| provider.shutdown())
            }
        }
    }

    // Runs `op` on its own thread and gives up after `flush_timeout`. The
    // thread keeps running against a stuck exporter; the caller does not.
    fn bounded(
        &self,
        provider: &SdkTracerProvider,
        op: fn(&SdkTracerProvider) -> OTelSdkResult,
    ) -> Result<(), FlushError> {
        let (sender, receiver) = sync_channel(1);
        let provider = provider.clone();
        thread::Builder::new()
            .name("isupipe-trace-flush".to_owned())
            .spawn(move || {
                let _ = sender.send(op(&provider));
            })
            .map_err(|err| FlushError::Failed(err.to_string()))?;

        match receiver.recv_timeout(self.flush_timeout) {
            Ok(result) => Ok(result?),
            Err(RecvTimeoutError::Timeout) => {
                otel_warn!(
                    name: "TracerProvider.FlushTimedOut",
                    timeout_ms = self.flush_timeout.as_millis() as u64
                );
                Err(FlushError::Timeout(self.flush_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(FlushError::Failed("flush thread exited".to_owned()))
            }
        }
    }
}

/// Build the tracing handle for `config`.
///
/// Does not touch the OpenTelemetry globals; see [`Tracing::install_global`].
pub fn init_provider(config: &TraceConfig) -> Result<Tracing, InitError> {
    let exporter = match config.backend {
        Backend::None => {
            otel_info!(name: "TracerProvider.Disabled");
            return Ok(Tracing::noop_with(config));
        }
        Backend::Jaeger => jaeger_exporter(config),
        Backend::CloudTrace => cloud_trace_exporter(config),
    };

    match exporter {
        Ok(exporter) => {
            otel_info!(
                name: "TracerProvider.Initialized",
                backend = config.backend.as_str(),
                service_name = config.service_name.clone()
            );
            Ok(Tracing::with_exporter(exporter, config))
        }
        Err(err) => match config.backend.init_failure_policy() {
            Some(InitFailurePolicy::Fallback) => {
                otel_warn!(
                    name: "TracerProvider.FallbackToNoop",
                    backend = config.backend.as_str(),
                    error = format!("{err}")
                );
                Ok(Tracing::noop_with(config))
            }
            Some(InitFailurePolicy::Propagate) | None => Err(err),
        },
    }
}

pub(crate) fn resource(config: &TraceConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(ENVIRONMENT_KEY, config.environment.clone()),
        KeyValue::new(VERSION_KEY, config.version.clone()),
    ];
    if config.backend == Backend::CloudTrace {
        attributes.push(KeyValue::new(
            GCP_PROJECT_ID_KEY,
            config.cloud_trace_project_id.clone(),
        ));
    }

    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes(attributes)
        .build()
}

fn jaeger_exporter(config: &TraceConfig) -> Result<opentelemetry_otlp::SpanExporter, InitError> {
    validate_endpoint(Backend::Jaeger, &config.jaeger_endpoint)?;

    opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(config.jaeger_endpoint.clone())
        .build()
        .map_err(|err| InitError::exporter(Backend::Jaeger, err.to_string()))
}

fn cloud_trace_exporter(
    config: &TraceConfig,
) -> Result<opentelemetry_otlp::SpanExporter, InitError> {
    validate_project_id(&config.cloud_trace_project_id)?;
    validate_endpoint(Backend::CloudTrace, &config.cloud_trace_endpoint)?;

    let mut headers = HashMap::from([(
        GOOG_USER_PROJECT_HEADER.to_owned(),
        config.cloud_trace_project_id.clone(),
    )]);
    if let Some(token) = &config.cloud_trace_access_token {
        headers.insert(
            http::header::AUTHORIZATION.as_str().to_owned(),
            format!("Bearer {token}"),
        );
    }

    opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(config.cloud_trace_endpoint.clone())
        .with_headers(headers)
        .build()
        .map_err(|err| InitError::exporter(Backend::CloudTrace, err.to_string()))
}

fn validate_endpoint(backend: Backend, endpoint: &str) -> Result<(), InitError> {
    let uri: http::Uri = endpoint.parse().map_err(|err| {
        InitError::exporter(backend, format!("invalid endpoint {endpoint:?}: {err}"))
    })?;

    if !matches!(uri.scheme_str(), Some("http") | Some("https")) {
        return Err(InitError::exporter(
            backend,
            format!("endpoint {endpoint:?} must use http or https"),
        ));
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(InitError::exporter(
            backend,
            format!("endpoint {endpoint:?} has no host"),
        ));
    }
    if uri.port_u16() == Some(0) {
        return Err(InitError::exporter(
            backend,
            format!("endpoint {endpoint:?} has port 0"),
        ));
    }

    Ok(())
}

// 6 to 30 characters: a lowercase letter, then lowercase letters, digits or
// hyphens, not ending with a hyphen.
fn validate_project_id(project_id: &str) -> Result<(), InitError> {
    let bytes = project_id.as_bytes();
    let valid = (6..=30).contains(&bytes.len())
        && bytes.first().is_some_and(u8::is_ascii_lowercase)
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && !project_id.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(InitError::exporter(
            Backend::CloudTrace,
            format!("invalid project id {project_id:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::end_span;
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry::trace::TraceContextExt;
    use opentelemetry::{Key, Value};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
    use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
    use rstest::rstest;
    use std::time::Instant;

    // nothing listens on the discard port, exports fail fast
    const UNREACHABLE_ENDPOINT: &str = "http://127.0.0.1:9/v1/traces";

    // export outlasts any flush timeout used below
    #[derive(Debug)]
    struct SlowExporter(Duration);

    impl SpanExporter for SlowExporter {
        fn export(
            &self,
            _batch: Vec<SpanData>,
        ) -> impl std::future::Future<Output = OTelSdkResult> + Send {
            let delay = self.0;
            async move {
                thread::sleep(delay);
                Ok(())
            }
        }
    }

    #[test]
    fn failure_policy_table() {
        assert_eq!(
            Backend::Jaeger.init_failure_policy(),
            Some(InitFailurePolicy::Fallback)
        );
        assert_eq!(
            Backend::CloudTrace.init_failure_policy(),
            Some(InitFailurePolicy::Propagate)
        );
        assert_eq!(Backend::None.init_failure_policy(), None);
    }

    #[test]
    fn none_backend_is_noop() {
        let config = TraceConfig::default()
            .with_backend(Backend::None)
            .with_propagation(Propagation::TraceContext);
        let tracing = init_provider(&config).unwrap();

        assert!(tracing.is_noop());
        assert_eq!(tracing.propagation(), Propagation::TraceContext);
        assert!(tracing.force_flush().is_ok());
        assert!(tracing.shutdown().is_ok());
    }

    #[rstest]
    #[case::bad_port("http://bad-host:0")]
    #[case::empty("")]
    #[case::not_a_url("not a url")]
    #[case::unsupported_scheme("ftp://collector:4318/v1/traces")]
    #[case::missing_scheme("collector:4318/v1/traces")]
    fn jaeger_failure_falls_back_to_noop(#[case] endpoint: &str) {
        let config = TraceConfig::default()
            .with_backend(Backend::Jaeger)
            .with_jaeger_endpoint(endpoint);
        let tracing = init_provider(&config).unwrap();
        assert!(tracing.is_noop());

        // requests still go through the fallback handle
        let cx = tracing.start_span(&Context::new(), "getUserHandler", Vec::new());
        end_span(&cx, None);
        assert!(tracing.shutdown().is_ok());
    }

    #[test]
    fn jaeger_exporter_is_built() {
        let config = TraceConfig::default()
            .with_backend(Backend::Jaeger)
            .with_jaeger_endpoint(UNREACHABLE_ENDPOINT)
            .with_flush_timeout(Duration::from_millis(500));
        let tracing = init_provider(&config).unwrap();
        assert!(!tracing.is_noop());

        let cx = tracing.start_span(&Context::new(), "getUserHandler", Vec::new());
        assert!(cx.span().is_recording());
        end_span(&cx, None);

        // the collector is unreachable; shutdown may fail but stays bounded
        let started = Instant::now();
        let result = tracing.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2), "{result:?}");
    }

    #[rstest]
    #[case::empty("")]
    #[case::too_short("isu13")]
    #[case::too_long("isu13-406204-isu13-406204-isu13")]
    #[case::leading_digit("13isu-406204")]
    #[case::upper_case("ISU13-406204")]
    #[case::underscore("isu13_406204")]
    #[case::trailing_hyphen("isu13-406204-")]
    fn cloud_trace_failure_is_returned(#[case] project_id: &str) {
        let config = TraceConfig::default()
            .with_backend(Backend::CloudTrace)
            .with_cloud_trace_project_id(project_id);

        match init_provider(&config) {
            Err(InitError::ExporterInitFailure { backend, .. }) => {
                assert_eq!(backend, Backend::CloudTrace)
            }
            other => panic!("expected ExporterInitFailure, got {other:?}"),
        }
    }

    #[test]
    fn cloud_trace_bad_endpoint_is_returned() {
        let config = TraceConfig::default()
            .with_backend(Backend::CloudTrace)
            .with_cloud_trace_endpoint("telemetry.googleapis.com");

        assert!(matches!(
            init_provider(&config),
            Err(InitError::ExporterInitFailure {
                backend: Backend::CloudTrace,
                ..
            })
        ));
    }

    #[rstest]
    #[case("isu13-406204")]
    #[case("my-project-01")]
    #[case("abcdef")]
    fn valid_project_ids(#[case] project_id: &str) {
        assert!(validate_project_id(project_id).is_ok());
    }

    #[test]
    fn cloud_trace_exporter_is_built() {
        let config = TraceConfig::default()
            .with_backend(Backend::CloudTrace)
            .with_cloud_trace_endpoint(UNREACHABLE_ENDPOINT)
            .with_cloud_trace_access_token("ya29.token")
            .with_flush_timeout(Duration::from_millis(200));
        let tracing = init_provider(&config).unwrap();

        assert!(!tracing.is_noop());
        assert_eq!(tracing.propagation(), Propagation::CloudTraceContext);

        // export happens on the batch thread, never on the request path
        let started = Instant::now();
        let cx = tracing.start_span(&Context::new(), "getUserHandler", Vec::new());
        assert!(cx.span().is_recording());
        end_span(&cx, None);
        assert!(started.elapsed() < Duration::from_millis(250));

        let started = Instant::now();
        let result = tracing.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1), "{result:?}");
    }

    #[test]
    fn shutdown_gives_up_after_flush_timeout() {
        let flush_timeout = Duration::from_millis(50);
        let config = TraceConfig::default().with_flush_timeout(flush_timeout);
        let tracing = Tracing::with_exporter(SlowExporter(Duration::from_secs(2)), &config);

        let cx = tracing.start_span(&Context::new(), "getUserHandler", Vec::new());
        end_span(&cx, None);

        let started = Instant::now();
        let result = tracing.shutdown();
        let elapsed = started.elapsed();

        assert!(
            matches!(result, Err(FlushError::Timeout(timeout)) if timeout == flush_timeout),
            "{result:?}"
        );
        assert!(elapsed >= flush_timeout);
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[test]
    fn force_flush_gives_up_after_flush_timeout() {
        let flush_timeout = Duration::from_millis(50);
        let config = TraceConfig::default().with_flush_timeout(flush_timeout);
        let tracing = Tracing::with_exporter(SlowExporter(Duration::from_millis(300)), &config);

        let cx = tracing.start_span(&Context::new(), "getUserHandler", Vec::new());
        end_span(&cx, None);

        let started = Instant::now();
        assert!(matches!(tracing.force_flush(), Err(FlushError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn resource_attributes() {
        let config = TraceConfig::default()
            .with_service_name("isupipe-api")
            .with_environment("production")
            .with_version("v1.2.3");
        let resource = resource(&config);

        assert_eq!(
            resource.get(&Key::from_static_str(SERVICE_NAME)),
            Some(Value::from("isupipe-api"))
        );
        assert_eq!(
            resource.get(&Key::from_static_str(ENVIRONMENT_KEY)),
            Some(Value::from("production"))
        );
        assert_eq!(
            resource.get(&Key::from_static_str(VERSION_KEY)),
            Some(Value::from("v1.2.3"))
        );
        assert_eq!(
            resource.get(&Key::from_static_str(GCP_PROJECT_ID_KEY)),
            Some(Value::from("isu13-406204"))
        );

        let jaeger = super::resource(&config.with_backend(Backend::Jaeger));
        assert_eq!(jaeger.get(&Key::from_static_str(GCP_PROJECT_ID_KEY)), None);
    }

    #[test]
    fn resource_defaults() {
        let resource = resource(&TraceConfig::default());

        assert_eq!(
            resource.get(&Key::from_static_str(SERVICE_NAME)),
            Some(Value::from("isu13"))
        );
        assert_eq!(
            resource.get(&Key::from_static_str(ENVIRONMENT_KEY)),
            Some(Value::from("local"))
        );
        assert!(resource.get(&Key::from_static_str(VERSION_KEY)).is_some());
    }

    #[test]
    fn exported_spans_carry_resource() {
        let exporter = InMemorySpanExporter::default();
        let config = TraceConfig::default()
            .with_backend(Backend::Jaeger)
            .with_service_name("isupipe-api");
        let tracing = Tracing::with_exporter(exporter.clone(), &config);

        let cx = tracing.start_span(&Context::new(), "getUserHandler", Vec::new());
        end_span(&cx, None);
        tracing.force_flush().unwrap();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].instrumentation_scope.name(), INSTRUMENTATION_SCOPE);
    }

    #[test]
    fn shutdown_is_reported_once() {
        let tracing =
            Tracing::with_exporter(InMemorySpanExporter::default(), &TraceConfig::default());

        assert!(tracing.shutdown().is_ok());
        assert!(matches!(tracing.shutdown(), Err(FlushError::Failed(_))));
    }

    #[test]
    fn install_global_sets_standard_propagator() {
        // the handle's dialect does not pick the global propagator
        let config = TraceConfig::default().with_propagation(Propagation::CloudTraceContext);
        Tracing::noop_with(&config).install_global();

        let mut fields = global::get_text_map_propagator(|propagator| {
            propagator.fields().map(str::to_owned).collect::<Vec<_>>()
        });
        fields.sort();
        assert_eq!(
            fields,
            vec![
                "traceparent".to_string(),
                "tracestate".to_string(),
                "x-cloud-trace-context".to_string(),
            ]
        );

        let headers: HashMap<String, String> = [(
            "traceparent".to_string(),
            "00-105445aa7843bc8bf206b12000100000-00f067aa0ba902b7-01".to_string(),
        )]
        .into_iter()
        .collect();
        let cx = global::get_text_map_propagator(|propagator| propagator.extract(&headers));
        assert_eq!(
            cx.span().span_context().trace_id().to_string(),
            "105445aa7843bc8bf206b12000100000"
        );
    }

    #[test]
    fn propagation_goes_through_the_handle() {
        let tracing = Tracing::noop_with(
            &TraceConfig::default().with_propagation(Propagation::TraceContext),
        );
        let headers: HashMap<String, String> = [(
            "traceparent".to_string(),
            "00-105445aa7843bc8bf206b12000100000-00f067aa0ba902b7-01".to_string(),
        )]
        .into_iter()
        .collect();

        assert_eq!(
            tracing.extract_trace_id(&headers),
            "105445aa7843bc8bf206b12000100000"
        );

        let cx = tracing.inject_remote(&Context::new(), &headers);
        let mut outbound: HashMap<String, String> = HashMap::new();
        tracing.inject(&cx, &mut outbound);
        assert_eq!(outbound.get("traceparent"), headers.get("traceparent"));
    }
}
