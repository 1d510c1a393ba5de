use std::sync::Arc;

use rfsync_core::{Config, CredentialStore, MetadataCache, ServiceType};
use rfsync_watch::{CacheUpdater, Watcher};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::client::SyncClient;
use crate::error::{io_err, net_err, DaemonError};
use crate::server::Server;
use crate::tls;
use crate::transport::{Credentials, Dialer};

/// Build a multi-threaded runtime and run until ctrl-c or a fatal error.
pub fn start_blocking(config: Config) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let signal = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    signal = tokio::signal::ctrl_c() => match signal {
                        Ok(()) => tracing::info!("received ctrl-c, shutting down"),
                        Err(err) => tracing::error!(error = %err, "ctrl-c handler failed"),
                    },
                }
                shutdown.cancel();
            })
        };
        let result = run(config, shutdown.clone()).await;
        shutdown.cancel();
        let _ = signal.await;
        result
    })
}

/// Run the configured side until `shutdown` is cancelled.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), DaemonError> {
    match config.service_type {
        ServiceType::Server => run_server(config, shutdown).await,
        ServiceType::Client => run_client(config, shutdown).await,
    }
}

async fn run_server(config: Config, shutdown: CancellationToken) -> Result<(), DaemonError> {
    let cache = Arc::new(MetadataCache::new(&config.path)?);

    let mut server = Server::new(cache.clone(), config.buffer_size);
    if let Some(pw_file) = &config.server.pw_file {
        let store = CredentialStore::open(pw_file)?;
        tracing::info!(
            path = %pw_file.display(),
            users = store.usernames().len(),
            "authentication enabled",
        );
        server = server.with_credentials(Arc::new(store));
    }
    if let Some(material) = &config.server.tls {
        server = server.with_tls(tls::server_acceptor(material)?);
    }
    let server = Arc::new(server);

    let listener = TcpListener::bind(&config.address)
        .await
        .map_err(|e| net_err(&config.address, e))?;
    let watcher = Watcher::builder(cache.root())
        .buffer_size(config.buffer_size)
        .subscribe(Arc::new(CacheUpdater::new(cache.clone())))
        .subscribe(server.clone())
        .start()?;

    let serve_handle = tokio::spawn(server.clone().serve(listener));
    let stop_handle = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            server.shutdown();
        })
    };

    let served = serve_handle.await;
    shutdown.cancel();
    let _ = stop_handle.await;
    watcher.close().await;
    handle_join("server", served)
}

async fn run_client(config: Config, shutdown: CancellationToken) -> Result<(), DaemonError> {
    let cache = Arc::new(MetadataCache::new(&config.path)?);
    let watcher = Watcher::builder(cache.root())
        .buffer_size(config.buffer_size)
        .subscribe(Arc::new(CacheUpdater::new(cache.clone())))
        .start()?;

    let client = Arc::new(
        SyncClient::new(dialer_for(&config)?, cache).initial_sync(config.client.initial_sync),
    );
    let stop_handle = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            client.exit();
        })
    };

    let result = client.run().await;
    shutdown.cancel();
    let _ = stop_handle.await;
    watcher.close().await;
    result
}

/// Dialer carrying the client's TLS and Join settings.
pub fn dialer_for(config: &Config) -> Result<Dialer, DaemonError> {
    let mut dialer = Dialer::new(config.address.clone());
    let tls_config = &config.client.tls;
    if tls_config.enable {
        dialer = dialer.with_tls(
            tls::client_connector(tls_config)?,
            tls::server_name(tls_config, &config.address)?,
        );
    }
    if let Some(username) = config.username() {
        dialer = dialer.with_credentials(Credentials {
            username: username.to_string(),
            password: config.client.password.clone().unwrap_or_default(),
        });
    }
    Ok(dialer)
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(DaemonError::Task(task)),
    }
}

/// Install the `fmt` subscriber; `RUST_LOG` wins unless `debug` is set.
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
