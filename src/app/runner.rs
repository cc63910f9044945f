//! Gateway runner
//!
//! Entry point for running the Claude agent gateway.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::core::GatewayApp;
use crate::cli::Cli;
use crate::gateway;
use crate::types::AgentConfig;

// OpenTelemetry imports (only when feature is enabled)
#[cfg(feature = "otel")]
use opentelemetry::global;
#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace::SdkTracerProvider;

/// How often expired session logs are purged
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

// Global storage for OpenTelemetry provider (for proper shutdown)
#[cfg(feature = "otel")]
static OTEL_PROVIDER: std::sync::OnceLock<SdkTracerProvider> = std::sync::OnceLock::new();

/// Shutdown OpenTelemetry provider (flush all pending spans)
///
/// This should be called before the application exits to ensure all
/// telemetry data is properly flushed to the backend.
#[cfg(feature = "otel")]
pub fn shutdown_otel() {
    if let Some(provider) = OTEL_PROVIDER.get() {
        tracing::info!("Shutting down OpenTelemetry provider...");
        if let Err(e) = provider.shutdown() {
            eprintln!("Failed to shutdown OpenTelemetry provider: {:?}", e);
        } else {
            tracing::info!("OpenTelemetry provider shutdown complete");
        }
    }
}

/// Shutdown OpenTelemetry provider (no-op when feature is disabled)
#[cfg(not(feature = "otel"))]
pub fn shutdown_otel() {}

#[cfg(feature = "otel")]
fn init_otel(endpoint: &str, service_name: &str) -> anyhow::Result<SdkTracerProvider> {
    use opentelemetry_sdk::Resource;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

/// Build an EnvFilter based on CLI args and RUST_LOG environment variable
///
/// Priority: RUST_LOG environment variable > CLI arguments (-v, -vv, -q)
fn build_env_filter(cli: &Cli) -> tracing_subscriber::EnvFilter {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if !rust_log.is_empty() {
            return tracing_subscriber::EnvFilter::new(rust_log);
        }
    }

    let level = cli.log_level();
    tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into())
}

/// Install the subscriber with the given writer, plus the OTLP layer if enabled
fn install_subscriber<W>(cli: &Cli, writer: W) -> anyhow::Result<()>
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = build_env_filter(cli);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);

    #[cfg(feature = "otel")]
    {
        if let (true, Some(endpoint)) = (cli.is_otel_enabled(), cli.otel_endpoint.as_deref()) {
            let service_name = &cli.otel_service_name;
            eprintln!(
                "OpenTelemetry enabled: endpoint={}, service={}",
                endpoint, service_name
            );

            let provider = init_otel(endpoint, service_name)?;
            let tracer = provider.tracer("claude-agent-gateway");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

            // Store provider globally for proper shutdown
            drop(OTEL_PROVIDER.set(provider));

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(otel_layer)
                .try_init()?;
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Initialize logging based on CLI arguments
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    if cli.is_diagnostic() {
        let log_path = cli.log_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&log_path)?;

        // Output log file location to stderr (user needs to know)
        eprintln!("Diagnostic mode: logging to {}", log_path.display());
        install_subscriber(cli, std::sync::Mutex::new(file))
    } else {
        install_subscriber(cli, std::io::stderr)
    }
}

/// Run the gateway with CLI arguments until `shutdown` resolves
///
/// Initializes logging, opens the session store, serves the HTTP and
/// websocket routes and, on shutdown, tears down every live session.
pub async fn run_gateway_with_cli<F>(cli: &Cli, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let startup_time = Instant::now();

    // Initialize logging first (must happen before any tracing)
    init_logging(cli)?;

    let mut config = cli.to_config()?;
    let provider = AgentConfig::from_env();
    provider.apply_to_options(&mut config.engine);

    {
        let startup_span = tracing::info_span!(
            "gateway_startup",
            version = %env!("CARGO_PKG_VERSION"),
            pid = %std::process::id(),
            diagnostic = %cli.is_diagnostic(),
            otel_enabled = %cli.otel_endpoint.is_some(),
        );
        let _enter = startup_span.enter();

        tracing::info!("========== Claude Agent Gateway Starting ==========");
        tracing::info!(
            listen = %config.listen,
            store = %config.store,
            retention_secs = config.retention.as_secs(),
            approval_timeout_secs = config.orchestrator.approval_timeout.as_secs(),
            reconnect_grace_secs = config.reconnect_grace.as_secs(),
            engine = ?config.engine.program,
            "Gateway configuration"
        );
        tracing::info!(
            configured = provider.is_configured(),
            has_base_url = provider.base_url.is_some(),
            has_api_key = provider.api_key.is_some(),
            has_model = provider.model.is_some(),
            "Provider configuration"
        );
        if cli.is_diagnostic() {
            tracing::info!(log_path = %cli.log_path().display(), "Diagnostic mode enabled");
        }
    }

    let listener = TcpListener::bind(config.listen).await?;
    let app = GatewayApp::new(config);

    tracing::info!(
        elapsed_ms = startup_time.elapsed().as_millis(),
        store_backend = app.log().backend(),
        store_degraded = app.log().is_degraded(),
        "Gateway ready"
    );

    let result = run_gateway(&app, listener, shutdown).await;

    tracing::info!(
        uptime_secs = startup_time.elapsed().as_secs(),
        "========== Gateway Shutdown Complete =========="
    );
    result
}

/// Serve an already-built gateway on `listener` until `shutdown` resolves
pub async fn run_gateway<F>(app: &GatewayApp, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let purge = spawn_purge_task(app, token.clone());

    let signal = token.clone();
    let result = gateway::serve(listener, app.gateway_state(token.clone()), async move {
        tokio::select! {
            () = shutdown => {}
            () = signal.cancelled() => {}
        }
        signal.cancel();
    })
    .await;

    token.cancel();
    purge.abort();
    app.registry().shutdown_all().await;

    result.map_err(|e| {
        tracing::error!(error = %e, "Gateway server error");
        e.into()
    })
}

fn spawn_purge_task(app: &GatewayApp, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    let log = app.log().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    let purged = log.purge_expired().await;
                    if purged > 0 {
                        tracing::info!(purged, "Purged expired session logs");
                    }
                }
            }
        }
    })
}
