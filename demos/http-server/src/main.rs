//! HTTP server wiring the tracing handle into request handling.
//!
//! ```sh
//! PROVIDER=jaeger cargo run -p isupipe-http-server
//! curl -H 'X-Cloud-Trace-Context: 105445aa7843bc8bf206b12000100000/1;o=1' localhost:8080/api/trace
//! ```
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use isupipe_trace::{end_span, init_provider, set_attributes, TraceConfig, Tracing};
use opentelemetry::{Context, KeyValue};
use opentelemetry_http::{Bytes, HeaderExtractor};
use opentelemetry_semantic_conventions::attribute::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_PATH,
};
use std::{convert::Infallible, error::Error, io, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LISTEN_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);

async fn router(
    telemetry: Tracing,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let headers = HeaderExtractor(req.headers());
    let parent_cx = telemetry.inject_remote(&Context::new(), &headers);
    let path = req.uri().path().to_owned();
    let cx = telemetry.start_span(
        &parent_cx,
        format!("{} {}", req.method(), path),
        [
            KeyValue::new(HTTP_REQUEST_METHOD, req.method().to_string()),
            KeyValue::new(URL_PATH, path.clone()),
        ],
    );

    let (status, body, err) = match (req.method(), path.as_str()) {
        (&Method::GET, "/api/health") => (StatusCode::OK, "ok".to_owned(), None),
        // the trace id the load balancer assigned to this request
        (&Method::GET, "/api/trace") => {
            (StatusCode::OK, telemetry.extract_trace_id(&headers), None)
        }
        _ => (
            StatusCode::NOT_FOUND,
            String::new(),
            Some(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no route for {path}"),
            )),
        ),
    };

    set_attributes(
        &cx,
        [KeyValue::new(
            HTTP_RESPONSE_STATUS_CODE,
            i64::from(status.as_u16()),
        )],
    );
    end_span(&cx, err.as_ref().map(|err| err as &dyn Error));
    info!(name: "request", path = %path, status = status.as_u16());

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    Ok(response)
}

async fn serve(telemetry: Tracing) -> io::Result<()> {
    let addr = SocketAddr::from(LISTEN_ADDR);
    let listener = TcpListener::bind(addr).await?;
    info!(name: "listening", addr = %addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(name: "accept_failed", error = %err);
                        continue;
                    }
                };
                let telemetry = telemetry.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| router(telemetry.clone(), req));
                    if let Err(err) = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        warn!(name: "connection_failed", error = %err);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!(name: "shutdown", message = "received ctrl-c");
                return Ok(());
            }
        }
    }
}

fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // built outside the runtime; the OTLP exporter uses a blocking HTTP client
    let config = TraceConfig::from_env();
    let telemetry = init_provider(&config)?;
    telemetry.install_global();
    info!(
        name: "tracing_initialized",
        backend = %config.backend,
        service_name = %config.service_name,
        noop = telemetry.is_noop()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(serve(telemetry.clone()));
    drop(runtime);

    if let Err(err) = telemetry.shutdown() {
        warn!(name: "tracing_shutdown_failed", error = %err);
    }
    served?;
    Ok(())
}
