use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mailroom_core::{ToolDispatcher, ToolError};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Newline-delimited JSON-RPC 2.0 over a byte stream. stdout carries only
/// protocol frames; all logging goes to stderr.
pub async fn run<R, W>(
    dispatcher: Arc<ToolDispatcher>,
    reader: R,
    mut writer: W,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("stdin closed, leaving rpc loop");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&dispatcher, &line).await;
        let serialized = serde_json::to_string(&response)?;
        writer.write_all(serialized.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn handle_line(dispatcher: &ToolDispatcher, line: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "unparseable request frame");
            return json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": {"code": -32700, "message": format!("parse error: {err}")},
            });
        }
    };

    let id = request.id.clone();
    match handle_request(dispatcher, request).await {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(err) => json!({"jsonrpc": "2.0", "id": id, "error": err.to_error_value()}),
    }
}

async fn handle_request(
    dispatcher: &ToolDispatcher,
    request: RpcRequest,
) -> Result<Value, ToolError> {
    match request.method.as_str() {
        "tools/list" => Ok(dispatcher.list_tools()),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidParams("params.name is required".to_string()))?;
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));

            let result = dispatcher.dispatch(name, arguments).await?;
            let text = serde_json::to_string(&result)
                .map_err(|err| ToolError::Internal(err.to_string()))?;
            Ok(json!({
                "content": [{"type": "text", "text": text}],
            }))
        }
        other => Err(ToolError::MethodNotFound(other.to_string())),
    }
}
