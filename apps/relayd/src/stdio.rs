//! Newline-delimited JSON-RPC over stdin/stdout.
//!
//! Stdout carries only protocol responses; logging goes to stderr.

use std::sync::Arc;

use anyhow::Result;
use relay_tools::{RequestMeta, ToolSurface};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::rpc::{self, RpcRequest};

pub async fn serve(surface: Arc<ToolSurface>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => rpc::handle_request(&surface, request, RequestMeta::empty()).await,
            Err(error) => Some(rpc::parse_error(error)),
        };
        let Some(response) = response else {
            continue;
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        stdout.write_all(&payload).await?;
        stdout.flush().await?;
    }

    debug!("stdin closed, shutting down");
    Ok(())
}
