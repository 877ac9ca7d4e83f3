//! Listener start/stop.
//!
//! The HTTP server runs on its own task so the caller's task is free to wait
//! for the shutdown signal. Once it fires, in-flight requests get
//! `IntakeConfig::shutdown_grace` to finish; past that the shutdown is forced
//! and reported as [`LifecycleError::ShutdownTimeout`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::info;

use crate::catalog::ProductCatalog;
use crate::config::IntakeConfig;
use crate::server::{self, AppState};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),

    #[error("server task failed: {0}")]
    Task(#[from] JoinError),

    #[error("server forced to shut down: requests still in flight after {}ms", .0.as_millis())]
    ShutdownTimeout(Duration),
}

/// Binds `0.0.0.0:{port}`, serves until `shutdown` resolves, then drains.
pub async fn run<S>(
    config: &IntakeConfig,
    catalog: ProductCatalog,
    shutdown: S,
) -> Result<(), LifecycleError>
where
    S: Future<Output = ()>,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| LifecycleError::Bind { addr, source })?;
    info!(addr = %addr, products = catalog.len(), "Artifact intake server listening");

    let state = AppState::new(catalog, config);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(server::serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        result = &mut server => {
            return result?.map_err(LifecycleError::Serve);
        }
        () = shutdown => {}
    }

    info!(grace_ms = config.shutdown_grace.as_millis() as u64, "Shutting down the server");
    let _ = stop_tx.send(());

    match tokio::time::timeout(config.shutdown_grace, &mut server).await {
        Ok(result) => {
            result?.map_err(LifecycleError::Serve)?;
            info!("Server stopped");
            Ok(())
        }
        Err(_) => {
            server.abort();
            Err(LifecycleError::ShutdownTimeout(config.shutdown_grace))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::InMemoryEnv;

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let env = InMemoryEnv::new();
        env.set("INTAKE_PORT", port.to_string());
        let config = IntakeConfig::from_env(&env);

        let result = run(&config, ProductCatalog::default(), std::future::pending()).await;

        assert!(matches!(result, Err(LifecycleError::Bind { addr, .. }) if addr.port() == port));
    }

    #[test]
    fn shutdown_timeout_display() {
        let err = LifecycleError::ShutdownTimeout(Duration::from_secs(3));
        assert_eq!(
            err.to_string(),
            "server forced to shut down: requests still in flight after 3000ms"
        );
    }
}
