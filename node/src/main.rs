use axum::serve;
use chatsync_node::remote::MemoryRemote;
use chatsync_node::storage::{LocalCache, SledKv};
use chatsync_node::{init_tracing, router, AppConfig, AppState, SyncEngine};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let kv = SledKv::open(&config.data_dir)?;
    let cache = LocalCache::new(Arc::new(kv), config.sync.cache_limit);
    let remote = MemoryRemote::new(config.local_user.clone());
    let engine = SyncEngine::new(
        config.local_user.clone(),
        Arc::new(remote.clone()),
        Arc::new(remote),
        cache,
        config.sync.clone(),
    );
    let state = AppState::new(config.clone(), engine);

    let app = router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(
        %local_addr,
        build_id = %config.build_id,
        local_user = %config.local_user,
        "starting chatsync node"
    );

    serve(listener, app).await?;
    Ok(())
}
