use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use derecho::cancel::{CancelService, InProcessBus};
use derecho::config::Config;
use derecho::http::{self, AppState};
use derecho::persist::store::MemoryDocumentStore;
use derecho::persist::{MessageWriter, PersistOptions};
use derecho::poller::{PollerConfig, PollerSupervisor};
use derecho::router::ModelRouter;
use derecho::stream::manager::StreamManager;
use derecho::tools::executor::{ToolExecutor, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("derecho starting");

    let config = Config::load().inspect_err(|e| tracing::error!("{e}"))?;
    let shutdown = CancellationToken::new();
    let client = http::http_client();

    // deployments swap in a real document store and pub/sub bus here
    let store = Arc::new(MemoryDocumentStore::new());
    let writer = MessageWriter::new(store.clone(), PersistOptions::from(&config.runtime));
    let manager = StreamManager::new(writer.clone());
    manager.start_cleanup(shutdown.clone());
    let poller = PollerSupervisor::new(
        client.clone(),
        PollerConfig::from(&config.runtime),
        writer.clone(),
        shutdown.clone(),
    );
    let bus = Arc::new(InProcessBus::new());
    let cancel = CancelService::start(bus, manager.clone(), shutdown.clone()).await?;
    let tools = Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new())));
    let router = Arc::new(ModelRouter::new(config.table));

    let state = AppState {
        router,
        manager,
        writer: writer.clone(),
        poller,
        cancel,
        tools,
        store,
        client,
    };
    let app = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.runtime.listen_addr).await?;
    tracing::info!(addr = %config.runtime.listen_addr, "derecho listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    shutdown.cancel();
    writer.shutdown().await;

    tracing::info!("derecho shutting down");
    Ok(())
}
