//! # Tracing configuration
//!
//! [`TraceConfig`] is loaded once at process start, either from the
//! environment with [`TraceConfig::from_env`] or programmatically through the
//! `with_*` setters, and is treated as immutable afterwards.
//!
//! Configuration never fails startup: unknown or unparsable values are logged
//! and replaced by their defaults.
use crate::error::ConfigError;
use crate::propagation::Propagation;
use opentelemetry::otel_warn;
use std::env;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Overrides the service name reported in the resource.
pub const SERVICE: &str = "SERVICE";
/// Selects the exporter backend: `jaeger`, `cloud_trace` or `none`.
pub const PROVIDER: &str = "PROVIDER";
/// Deployment environment tag.
pub const ENVIRONMENT: &str = "ENVIRONMENT";
/// Overrides the build version reported in the resource.
pub const VERSION: &str = "VERSION";
/// Selects the inbound header dialect: `cloud_trace_context` or `tracecontext`.
pub const PROPAGATION: &str = "PROPAGATION";
/// OTLP/HTTP traces URL of the Jaeger collector.
pub const JAEGER_ENDPOINT: &str = "JAEGER_ENDPOINT";
/// Google Cloud project receiving the traces.
pub const CLOUD_TRACE_PROJECT_ID: &str = "CLOUD_TRACE_PROJECT_ID";
/// OTLP/HTTP traces URL of Cloud Trace.
pub const CLOUD_TRACE_ENDPOINT: &str = "CLOUD_TRACE_ENDPOINT";
/// OAuth access token sent as a bearer token to Cloud Trace.
pub const CLOUD_TRACE_ACCESS_TOKEN: &str = "CLOUD_TRACE_ACCESS_TOKEN";
/// Upper bound, in milliseconds, on the flush performed at shutdown.
pub const TRACE_FLUSH_TIMEOUT_MS: &str = "TRACE_FLUSH_TIMEOUT_MS";

/// Revision name set by the serverless runtime; used as the service name
/// when [`SERVICE`] is not set.
pub const K_REVISION: &str = "K_REVISION";

/// Service name used when neither [`SERVICE`] nor [`K_REVISION`] is set.
pub const DEFAULT_SERVICE_NAME: &str = "isu13";
/// Default value of [`ENVIRONMENT`].
pub const DEFAULT_ENVIRONMENT: &str = "local";
/// Version used when neither [`VERSION`] nor the `BUILD_VERSION` compile-time
/// variable is set.
pub const DEFAULT_VERSION: &str = "devel";
/// Default value of [`JAEGER_ENDPOINT`]: a collector on the local host.
pub const DEFAULT_JAEGER_ENDPOINT: &str = "http://localhost:4318/v1/traces";
/// Default value of [`CLOUD_TRACE_PROJECT_ID`].
pub const DEFAULT_CLOUD_TRACE_PROJECT_ID: &str = "isu13-406204";
/// Default value of [`CLOUD_TRACE_ENDPOINT`].
pub const DEFAULT_CLOUD_TRACE_ENDPOINT: &str = "https://telemetry.googleapis.com/v1/traces";
/// Default value of [`TRACE_FLUSH_TIMEOUT_MS`].
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Exporter backend selected at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Backend {
    /// No exporter; spans are not recorded.
    None,
    /// A Jaeger collector reached over OTLP/HTTP.
    Jaeger,
    /// Google Cloud Trace.
    #[default]
    CloudTrace,
}

impl Backend {
    /// Value accepted by [`PROVIDER`] for this backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::None => "none",
            Backend::Jaeger => "jaeger",
            Backend::CloudTrace => "cloud_trace",
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Backend::None),
            "jaeger" => Ok(Backend::Jaeger),
            "cloud_trace" => Ok(Backend::CloudTrace),
            _ => Err(ConfigError::UnknownValue {
                option: PROVIDER,
                value: s.to_owned(),
            }),
        }
    }
}

/// Tracing configuration, immutable once the provider is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceConfig {
    /// Exporter backend.
    pub backend: Backend,
    /// `service.name` resource attribute.
    pub service_name: String,
    /// `environment` resource attribute.
    pub environment: String,
    /// `service.version` resource attribute.
    pub version: String,
    /// Header dialect used to read inbound trace context.
    pub propagation: Propagation,
    /// Collector URL for [`Backend::Jaeger`].
    pub jaeger_endpoint: String,
    /// Project id for [`Backend::CloudTrace`].
    pub cloud_trace_project_id: String,
    /// Traces URL for [`Backend::CloudTrace`].
    pub cloud_trace_endpoint: String,
    /// Optional bearer token for [`Backend::CloudTrace`].
    pub cloud_trace_access_token: Option<String>,
    /// Upper bound on the flush performed at shutdown.
    pub flush_timeout: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            backend: Backend::default(),
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            environment: DEFAULT_ENVIRONMENT.to_owned(),
            version: option_env!("BUILD_VERSION")
                .unwrap_or(DEFAULT_VERSION)
                .to_owned(),
            propagation: Propagation::default(),
            jaeger_endpoint: DEFAULT_JAEGER_ENDPOINT.to_owned(),
            cloud_trace_project_id: DEFAULT_CLOUD_TRACE_PROJECT_ID.to_owned(),
            cloud_trace_endpoint: DEFAULT_CLOUD_TRACE_ENDPOINT.to_owned(),
            cloud_trace_access_token: None,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl TraceConfig {
    /// Load the configuration from the process environment.
    ///
    /// Empty variables count as unset.
    pub fn from_env() -> Self {
        let mut config = TraceConfig::default();

        if let Some(service) = env_value(SERVICE).or_else(|| env_value(K_REVISION)) {
            config.service_name = service;
        }
        if let Some(backend) = env_value(PROVIDER) {
            config.backend = parse_or_default(PROVIDER, &backend, Backend::None);
        }
        if let Some(environment) = env_value(ENVIRONMENT) {
            config.environment = environment;
        }
        if let Some(version) = env_value(VERSION) {
            config.version = version;
        }
        if let Some(propagation) = env_value(PROPAGATION) {
            config.propagation = parse_or_default(PROPAGATION, &propagation, config.propagation);
        }
        if let Some(endpoint) = env_value(JAEGER_ENDPOINT) {
            config.jaeger_endpoint = endpoint;
        }
        if let Some(project_id) = env_value(CLOUD_TRACE_PROJECT_ID) {
            config.cloud_trace_project_id = project_id;
        }
        if let Some(endpoint) = env_value(CLOUD_TRACE_ENDPOINT) {
            config.cloud_trace_endpoint = endpoint;
        }
        config.cloud_trace_access_token = env_value(CLOUD_TRACE_ACCESS_TOKEN);
        if let Some(timeout) = env_value(TRACE_FLUSH_TIMEOUT_MS) {
            match timeout.parse::<u64>() {
                Ok(millis) => config.flush_timeout = Duration::from_millis(millis),
                Err(err) => {
                    otel_warn!(
                        name: "TraceConfig.InvalidFlushTimeout",
                        value = timeout.clone(),
                        error = format!("{err}")
                    );
                }
            }
        }

        config
    }

    /// Set the exporter backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the service name.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Set the deployment environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the build version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the inbound header dialect.
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set the Jaeger collector URL.
    pub fn with_jaeger_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.jaeger_endpoint = endpoint.into();
        self
    }

    /// Set the Cloud Trace project id.
    pub fn with_cloud_trace_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.cloud_trace_project_id = project_id.into();
        self
    }

    /// Set the Cloud Trace traces URL.
    pub fn with_cloud_trace_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.cloud_trace_endpoint = endpoint.into();
        self
    }

    /// Set the bearer token sent to Cloud Trace.
    pub fn with_cloud_trace_access_token(mut self, token: impl Into<String>) -> Self {
        self.cloud_trace_access_token = Some(token.into());
        self
    }

    /// Set the shutdown flush bound.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or_default<T>(option: &'static str, value: &str, default: T) -> T
where
    T: FromStr<Err = ConfigError> + Display,
{
    value.parse().unwrap_or_else(|err: ConfigError| {
        otel_warn!(
            name: "TraceConfig.UnknownValue",
            option = option,
            error = format!("{err}"),
            fallback = format!("{default}")
        );
        default
    })
}
