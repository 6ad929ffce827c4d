// ABOUTME: Process bootstrap: bind the listener first, then supervise the store and seed in the background.
// ABOUTME: Requests are served immediately; store-backed handlers answer 503 until the store opens.

use std::net::SocketAddr;
use std::sync::Arc;

use tally_store::{
    ConnectionHandle, ConnectionManager, Connector, CredentialSeeder, SeedReport,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::app_state::{AppState, SharedState};
use crate::config::TallyConfig;
use crate::modules::{Capability, ModuleRegistry};
use crate::routes::{cors_layer, create_router};

/// Errors that keep the process from ever accepting requests.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CORS origin {0}")]
    Cors(String),

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Handles to everything `start` set in motion.
pub struct RunningServer {
    pub local_addr: SocketAddr,
    pub connection: ConnectionHandle,
    pub mounted: Vec<Capability>,
    /// Resolves once seeding has run, or to `None` if the store never opened.
    pub seeding: JoinHandle<Option<SeedReport>>,
    server: JoinHandle<std::io::Result<()>>,
    supervisor: JoinHandle<()>,
}

impl RunningServer {
    /// Wait until the HTTP server stops (ctrl-c), then stop the supervisor.
    pub async fn wait(self) -> Result<(), StartupError> {
        let served = self.server.await;
        self.supervisor.abort();
        self.seeding.abort();
        match served {
            Ok(result) => Ok(result?),
            Err(join) => Err(StartupError::Serve(std::io::Error::other(join))),
        }
    }

    /// Stop serving without waiting for a signal.
    pub fn shutdown(self) {
        self.server.abort();
        self.supervisor.abort();
        self.seeding.abort();
    }
}

/// Bring the service up. Returns as soon as the listener is bound; the
/// store connection and credential seeding proceed in the background.
pub async fn start(
    config: &TallyConfig,
    modules: ModuleRegistry,
    connector: Arc<dyn Connector>,
) -> Result<RunningServer, StartupError> {
    let modules = config
        .disabled_modules
        .iter()
        .fold(modules, |registry, capability| {
            tracing::info!(module = %capability, "module disabled by configuration");
            registry.without(*capability)
        });
    let mounted = modules.present();

    let (manager, opened) = ConnectionManager::new(connector, config.connection.clone());
    let connection = manager.handle();
    let state: SharedState = Arc::new(AppState::new(connection.clone()));

    let cors = cors_layer(&config.cors_origin)
        .map_err(|_| StartupError::Cors(config.cors_origin.clone()))?;
    let app = create_router(state, modules).layer(cors);

    let listener = TcpListener::bind(config.bind)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.bind,
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| StartupError::Bind {
            addr: config.bind,
            source,
        })?;
    tracing::info!(addr = %local_addr, "tally listening");

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    let supervisor = manager.start();
    let seeding = CredentialSeeder::new(config.seed.clone()).spawn_on_open(opened);

    Ok(RunningServer {
        local_addr,
        connection,
        mounted,
        seeding,
        server,
        supervisor,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c; serving until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
