use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use briefly_ai::HttpGeneratorFactory;
use briefly_infra::callback::CallbackClient;
use briefly_infra::config::AppConfig;
use briefly_infra::registry::seed_registry;
use briefly_infra::router::Router;
use briefly_infra::store::Store;
use briefly_infra::worker::{Worker, WorkerSettings};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    briefly_observability::init();

    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let store = match Store::open(Path::new(&config.database_path)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, path = %config.database_path, "failed to open store");
            std::process::exit(1);
        }
    };

    if let Err(e) = seed_registry(&store, &config.providers).await {
        tracing::error!(error = %e, "failed to seed provider registry");
        std::process::exit(1);
    }

    let generators = Arc::new(HttpGeneratorFactory::new(
        config.upstream_url.clone(),
        config.upstream_timeout,
    ));
    let router = Arc::new(Router::new(store.clone(), generators));
    let sink = Arc::new(CallbackClient::new(
        config.callback_url.clone(),
        config.internal_secret.clone(),
        CALLBACK_TIMEOUT,
    ));

    let worker = Worker::new(
        store.clone(),
        router,
        sink,
        WorkerSettings {
            concurrency: config.worker_concurrency,
            poll_interval: config.poll_interval,
            stale_timeout: config.stale_timeout,
            ..WorkerSettings::default()
        },
    )
    .spawn();

    let app = briefly_api::app::build_app(store);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {}", config.bind_addr, e));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap();

    tracing::info!("shutdown requested; draining workers");
    worker.shutdown().await;
}
