//! The tracering daemon: binds the producer and consumer sockets and runs
//! the service loop until interrupted.
//!
//! Exit codes: 0 clean shutdown, 64 configuration error, 65 bind error,
//! 70 internal invariant violated.

use std::process::ExitCode;
use tokio::net::UnixListener;
use trace_service::{ipc, ServiceConfig, TracingService};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 64;
const EXIT_BIND: u8 = 65;
const EXIT_INTERNAL: u8 = 70;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("traceringd: configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // All core logic runs on this single thread; producer writers live in
    // other processes entirely.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("traceringd: runtime setup failed: {e}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    let code = runtime.block_on(run(cfg));
    ExitCode::from(code)
}

async fn run(cfg: ServiceConfig) -> u8 {
    let producer_listener = match bind(&cfg.producer_addr) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("traceringd: cannot bind {}: {e}", cfg.producer_addr);
            return EXIT_BIND;
        }
    };
    let consumer_listener = match bind(&cfg.consumer_addr) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("traceringd: cannot bind {}: {e}", cfg.consumer_addr);
            return EXIT_BIND;
        }
    };
    tracing::info!(
        producer = %cfg.producer_addr,
        consumer = %cfg.consumer_addr,
        "traceringd listening"
    );

    let (service, handle) = TracingService::new(cfg);
    let service_task = tokio::spawn(service.run());

    tokio::spawn(ipc::serve_producers(producer_listener, handle.clone()));
    tokio::spawn(ipc::serve_consumers(consumer_listener, handle.clone()));

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("signal handler unavailable");
        return EXIT_INTERNAL;
    }
    tracing::info!("shutting down");
    handle.shutdown();
    match service_task.await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            // A panic on the service loop is the one globally fatal
            // condition.
            tracing::error!(error = %e, "service loop panicked");
            EXIT_INTERNAL
        }
    }
}

fn bind(path: &str) -> std::io::Result<UnixListener> {
    // A stale socket file from a previous run would otherwise fail the
    // bind with AddrInUse.
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path)
}
