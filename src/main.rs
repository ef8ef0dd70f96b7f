use clap::Parser; // for cli
use pistat::collectors::CollectorSet;
use pistat::config::Args;
use pistat::pipeline::ResponsePipeline;
use pistat::state::AppState;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

// this is main async function with tokio
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments (PISTAT_* env vars as fallback)
    let args = Args::parse();

    // RUST_LOG wins, otherwise --debug decides the level
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = args.gateway_config();

    // limiter and cache live as long as the process, owned through the pipeline
    let collectors = CollectorSet::standard(config.collector_timeout);
    let collector_count = collectors.len();
    let pipeline = ResponsePipeline::from_config(&config, collectors);
    let state = AppState::new(pipeline);

    let app = pistat::build_router(state.clone());

    let addr = args.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("pistat running on http://{}", addr);
    info!("{} collectors registered, timeout {:?} each", collector_count, config.collector_timeout);
    info!("Cache TTL: {} seconds", config.cache_ttl.as_secs());
    if config.rate_limit_enabled {
        info!(
            "Rate limit: {} requests per {} seconds per client",
            config.max_requests_per_window,
            config.window.as_secs()
        );
    } else {
        info!("Rate limit: disabled");
    }
    if config.compression_enabled {
        info!("Compression: gzip for payloads >= {} bytes", config.min_size_to_compress);
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.pipeline.cache().clear();
    info!("pistat stopped, cache cleared");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
