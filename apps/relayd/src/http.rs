//! Streamable HTTP endpoint for the tool surface.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use relay_tools::{RequestMeta, ToolSurface};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::rpc::{self, RpcRequest};

pub async fn serve(surface: Arc<ToolSurface>, addr: SocketAddr, path: &str) -> Result<()> {
    let app = Router::new()
        .route(path, post(handle_mcp))
        .with_state(surface)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, path, "relay-mesh HTTP endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn handle_mcp(
    State(surface): State<Arc<ToolSurface>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let meta = RequestMeta::new(
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect(),
    );

    match serde_json::from_str::<RpcRequest>(&body) {
        Ok(request) => match rpc::handle_request(&surface, request, meta).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
        Err(error) => Json(rpc::parse_error(error)).into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
