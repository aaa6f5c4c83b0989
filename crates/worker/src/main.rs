//! Worker entry point
//!
//! Exit codes: 0 clean shutdown, 1 fatal initialization error, 2
//! authentication failure.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use callagent_config::{load_settings, Settings};
use callagent_control::WsControlClient;
use callagent_worker::{Dispatcher, ProviderSet, WorkerError};

const EXIT_FATAL_INIT: i32 = 1;
const EXIT_AUTH: i32 = 2;

#[tokio::main]
async fn main() {
    let env = std::env::var("CALLAGENT_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load configuration: {}", err);
            std::process::exit(EXIT_FATAL_INIT);
        }
    };

    init_tracing(&settings);
    tracing::info!("starting callagent worker v{}", env!("CARGO_PKG_VERSION"));

    if let Err(err) = settings.validate() {
        tracing::error!(error = %err, "invalid configuration");
        std::process::exit(EXIT_FATAL_INIT);
    }

    let cancel = CancellationToken::new();

    let (control, control_events) =
        match WsControlClient::connect(&settings.control, cancel.child_token()) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(error = %err, "cannot reach control plane");
                std::process::exit(EXIT_FATAL_INIT);
            }
        };

    // Metrics consumers are external; the worker logs them structured.
    let (metrics_tx, mut metrics_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(event) = metrics_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(encoded) => tracing::info!(target: "callagent::metrics", event = %encoded),
                Err(err) => tracing::warn!(error = %err, "unencodable metrics event"),
            }
        }
    });

    let control: Arc<dyn callagent_control::RoomControl> = control;
    let dispatcher = Dispatcher::new(
        settings.clone(),
        control,
        control_events,
        ProviderSet::simulated(),
        metrics_tx,
    );

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    match dispatcher.run(cancel).await {
        Ok(()) => {
            tracing::info!("worker shutdown complete");
        }
        Err(WorkerError::Auth(message)) => {
            tracing::error!(error = %message, "control plane rejected credentials");
            std::process::exit(EXIT_AUTH);
        }
        Err(err) => {
            tracing::error!(error = %err, "worker failed");
            std::process::exit(EXIT_FATAL_INIT);
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize tracing with optional OpenTelemetry export
///
/// When `observability.otlp_endpoint` is set, traces export to the given
/// OTLP collector; otherwise console logging only.
fn init_tracing(settings: &Settings) {
    use opentelemetry_otlp::WithExportConfig;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("callagent={}", settings.observability.log_level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if let Some(otlp_endpoint) = &settings.observability.otlp_endpoint {
        match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(opentelemetry_sdk::trace::Config::default().with_resource(
                opentelemetry_sdk::Resource::new(vec![
                    opentelemetry::KeyValue::new("service.name", "callagent-worker"),
                    opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ]),
            ))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
        {
            Ok(tracer) => {
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                subscriber.with(fmt_layer).with(otel_layer).init();
                tracing::info!(endpoint = %otlp_endpoint, "otlp trace export enabled");
                return;
            }
            Err(err) => {
                eprintln!("failed to initialize OpenTelemetry: {}; console logging only", err);
            }
        }
    }

    subscriber.with(fmt_layer).init();
}
