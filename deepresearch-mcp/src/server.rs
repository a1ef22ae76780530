//! The MCP serve loop: read NDJSON messages, dispatch, write responses.

use crate::error::McpError;
use crate::handlers::RequestHandler;
use crate::protocol::{IncomingMessage, JsonRpcResponse, RequestId};
use crate::transport::Transport;
use tracing::{debug, warn};

/// Serve MCP requests from a transport until EOF.
///
/// Notifications get no reply; unparseable lines are answered with a
/// JSON-RPC parse error. A single bad request never terminates the loop.
pub async fn serve<T: Transport>(
    transport: &mut T,
    handler: &mut RequestHandler,
) -> Result<(), McpError> {
    while let Some(line) = transport.read_message().await? {
        if line.trim().is_empty() {
            continue;
        }

        let message: IncomingMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable JSON-RPC message");
                let response = JsonRpcResponse::from_mcp_error(
                    RequestId::Null,
                    McpError::ParseError {
                        message: e.to_string(),
                    },
                );
                transport
                    .write_message(&serde_json::to_string(&response)?)
                    .await?;
                continue;
            }
        };

        debug!(method = %message.method, notification = message.is_notification(), "request");
        let id = message.id.clone();
        let result = handler.route(&message.method, message.params).await;

        let Some(id) = id else {
            // Notification: no reply, even on error.
            if let Err(e) = result {
                warn!(method = %message.method, error = %e, "notification handling failed");
            }
            continue;
        };

        let response = match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::from_mcp_error(id, e),
        };
        transport
            .write_message(&serde_json::to_string(&response)?)
            .await?;
    }

    transport.close().await
}
