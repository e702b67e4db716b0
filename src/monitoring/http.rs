// Copyright (c) 2026 Meshsim
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `axum` HTTP surface exposing `/metrics` (Prometheus text exposition) and
//! `/healthz` (liveness), bound to `config.http.listenAddr` (spec.md §6).
//! Disabled entirely when `listen_addr` is empty.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use thiserror::Error;

use super::Metrics;
use crate::config::HttpConfig;

/// Errors standing up the HTTP observability surface.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The configured `listen_addr` could not be bound.
    #[error("binding HTTP listener on {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The server encountered an I/O error while serving.
    #[error("serving HTTP: {0}")]
    Serve(#[from] std::io::Error),
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> (StatusCode, String) {
    let families = metrics.registry.gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        tracing::error!(%err, "failed to encode prometheus metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buf) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::error!(%err, "prometheus output was not valid utf-8");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

fn router(metrics: Arc<Metrics>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).route("/healthz", get(healthz_handler)).with_state(metrics)
}

/// Serve `/metrics` and `/healthz` until the process is torn down. Returns
/// immediately (without binding) if `config.listen_addr` is empty.
pub async fn serve(config: &HttpConfig, metrics: Arc<Metrics>) -> Result<(), HttpError> {
    if config.listen_addr.is_empty() {
        tracing::debug!("HTTP observability surface disabled (no listenAddr configured)");
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|source| HttpError::Bind { addr: config.listen_addr.clone(), source })?;
    tracing::info!(addr = %config.listen_addr, "HTTP observability surface listening");

    axum::serve(listener, router(metrics)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_reports_ok() {
        let status = healthz_handler().await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_handler_encodes_registered_families() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.peers_connected.set(2);
        let (status, body) = metrics_handler(State(metrics)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("meshsim_peers_connected"));
    }

    #[test]
    fn router_registers_both_routes() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let _ = router(metrics);
    }

    #[tokio::test]
    async fn disabled_surface_returns_immediately() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = HttpConfig { listen_addr: String::new() };
        serve(&config, metrics).await.unwrap();
    }
}
