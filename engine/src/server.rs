//! Line-delimited JSON-RPC transport
//!
//! One request per line in, one response per line out. Requests are handled
//! sequentially in arrival order. Lines that do not parse are answered with
//! -32700 and never reach the gateway, so they are not audited.

use anyhow::{Context, Result};
use saan_sdk::errors::CODE_PARSE_ERROR;
use saan_sdk::{RpcError, RpcRequest};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::gateway::Gateway;

/// Serve requests from `reader` until EOF or Ctrl-C; returns the number answered
pub async fn serve<R, W>(gateway: &Gateway, reader: R, mut writer: W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut answered = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read request line")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping gateway");
                break;
            }
        };

        let Some(line) = line else {
            info!("Input closed, stopping gateway");
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = respond(gateway, line).await;
        let encoded = serde_json::to_string(&response).context("Failed to encode response")?;

        writer.write_all(encoded.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        answered += 1;
    }

    Ok(answered)
}

/// Answer a single raw line
pub async fn respond(gateway: &Gateway, line: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Unparseable request: {}", e);
            let mut response =
                RpcError::new(CODE_PARSE_ERROR, format!("Parse error: {}", e)).into_response();
            response["id"] = Value::Null;
            return response;
        }
    };

    debug!("<- {}", request.method);
    let mut response = gateway.handle_request(&request).await;

    if let Some(id) = &request.id {
        response["id"] = id.clone();
    }
    if let Some(version) = &request.jsonrpc {
        response["jsonrpc"] = Value::String(version.clone());
    }

    response
}
