use log::*;
use std::future::Future;
use tokio::net::TcpListener;

pub use self::error::{Error, Result};
pub use service::AppState;

mod controller;
mod error;
mod router;
mod socket;

pub use router::define_routes;

/// Binds the configured interface and port and serves until `shutdown`
/// resolves.
pub async fn init_server<F>(app_state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let server_url = format!("{interface}:{}", app_state.config.port);

    let listener = TcpListener::bind(&server_url).await?;
    info!("Server starting... listening for connections on http://{server_url}");

    serve_with_listener(app_state, listener, shutdown).await
}

/// Serves on an already bound listener. When `shutdown` resolves every client
/// is closed and every broker session released before the server stops.
pub async fn serve_with_listener<F>(
    app_state: AppState,
    listener: TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let manager = app_state.manager.clone();
    let router = define_routes(app_state);

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown requested");
            manager.shutdown().await;
        })
        .await
}
