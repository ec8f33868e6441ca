mod api;
mod authz;
mod cache;
mod config;
mod ctl;
mod error;
mod rate_limit;
mod resources;
mod session;
mod tunnel;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use abyss_shared::constants::PROXY_PORT;
use abyss_store::Database;

use crate::api::AppState;
use crate::authz::Authority;
use crate::config::ServerConfig;
use crate::ctl::CtlState;
use crate::rate_limit::RateLimiter;
use crate::resources::Resources;
use crate::session::SessionService;

/// Shared handle to the embedded database. All database operations are
/// suspension points behind this lock.
pub type Store = Arc<tokio::sync::Mutex<Database>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,abyss_server=debug")),
        )
        .init();

    info!("Starting Abyss server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::open_default()?,
    };
    let store: Store = Arc::new(tokio::sync::Mutex::new(database));

    let session = Arc::new(SessionService::new(store.clone(), config.debug_mode));
    let authority = Arc::new(Authority::new(store.clone(), &config.media_root));
    let resources = Arc::new(Resources::new(
        authority,
        store.clone(),
        config.debug_mode,
    ));

    let initialized = {
        let db = store.lock().await;
        !db.users_is_empty()?
    };
    if initialized {
        // Reserved directories and their attributes are re-asserted on
        // every start; bootstrap replaces rather than duplicates.
        resources.bootstrap().await?;
    } else {
        warn!(
            socket = %config.ctl_socket.display(),
            "no users yet; send `init` on the control socket to create root"
        );
    }

    let rate_limiter = RateLimiter::default();
    let app_state = AppState {
        session: session.clone(),
        resources: resources.clone(),
        store: store.clone(),
        config: Arc::new(config.clone()),
        rate_limiter: rate_limiter.clone(),
    };

    // Session cache sweep every minute; expired entries are also dropped
    // lazily on read.
    let sweep_session = session.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let purged = sweep_session.purge_expired();
            if purged > 0 {
                debug!(purged, "purged expired sessions and challenges");
            }
        }
    });

    // Rate limiter cleanup every 5 min, evict buckets idle >10 min.
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0);
        }
    });

    // Admin control socket.
    let ctl_state = CtlState {
        store: store.clone(),
        resources: resources.clone(),
    };
    let ctl_path = config.ctl_socket.clone();
    tokio::spawn(async move {
        if let Err(e) = ctl::serve(&ctl_path, ctl_state).await {
            tracing::error!(error = %e, "control socket failed");
        }
    });

    // Encrypted tunnel listener on its fixed port.
    let tunnel_listener = TcpListener::bind(("0.0.0.0", PROXY_PORT)).await?;
    let allowed_ports = Arc::new(config.allowed_ports.clone());
    let tunnel_session = session.clone();
    tokio::spawn(async move {
        if let Err(e) = tunnel::serve(tunnel_listener, tunnel_session, allowed_ports).await {
            tracing::error!(error = %e, "tunnel listener failed");
        }
    });

    let http_addr = config.http_addr;
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
