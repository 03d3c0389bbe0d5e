//! HTTP server hosting the management API behind the admission layer.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers;
use crate::admission::AdmissionControl;
use crate::error::Result;

/// HTTP server for the admission service.
pub struct AdmissionServer {
    /// Address to bind to
    addr: SocketAddr,
    control: Arc<AdmissionControl>,
    /// Install the admission layer on the API routes
    enforce: bool,
}

impl AdmissionServer {
    pub fn new(addr: SocketAddr, control: Arc<AdmissionControl>) -> Self {
        Self {
            addr,
            control,
            enforce: true,
        }
    }

    /// Serve the API without rate limiting it.
    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// The full application router.
    ///
    /// `/health` is never rate limited.
    pub fn router(&self) -> Router {
        let api = Router::new()
            .nest("/api/ratelimit", handlers::routes())
            .with_state(self.control.clone());

        let api = if self.enforce {
            self.control.protect(api)
        } else {
            api
        };

        api.route("/health", get(health))
    }

    /// Start the server and run until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %listener.local_addr()?,
            enforce = self.enforce,
            "Starting admission HTTP server"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
