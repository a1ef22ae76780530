//! MCP request handlers — routes JSON-RPC requests to the tool surface.

use crate::error::McpError;
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, ListToolsResult, ServerCapabilities,
    ServerInfo, ToolsCapability, MCP_PROTOCOL_VERSION,
};
use crate::tools::ToolSurface;
use serde_json::Value;
use tracing::{debug, info};

/// Handles MCP protocol requests by delegating to the tool surface.
pub struct RequestHandler {
    surface: ToolSurface,
    initialized: bool,
    server_info: ServerInfo,
}

impl RequestHandler {
    pub fn new(surface: ToolSurface) -> Self {
        Self {
            surface,
            initialized: false,
            server_info: ServerInfo {
                name: "deepresearch".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Handle the `initialize` request.
    pub fn handle_initialize(&mut self, params: InitializeParams) -> Result<Value, McpError> {
        info!(
            client = %params.client_info.name,
            client_version = ?params.client_info.version,
            protocol_version = %params.protocol_version,
            "MCP client connecting"
        );

        self.initialized = true;

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
            },
            server_info: self.server_info.clone(),
        };
        serde_json::to_value(result).map_err(|e| McpError::InternalError {
            message: format!("failed to serialize initialize result: {e}"),
        })
    }

    /// Handle the `tools/list` request.
    pub fn handle_tools_list(&self) -> Result<Value, McpError> {
        if !self.initialized {
            return Err(McpError::NotInitialized);
        }
        let tools = ToolSurface::definitions();
        debug!(count = tools.len(), "listing tools");
        serde_json::to_value(ListToolsResult { tools }).map_err(|e| McpError::InternalError {
            message: format!("failed to serialize tools list: {e}"),
        })
    }

    /// Handle the `tools/call` request.
    pub async fn handle_tools_call(&self, params: CallToolParams) -> Result<Value, McpError> {
        if !self.initialized {
            return Err(McpError::NotInitialized);
        }
        if !ToolSurface::has_tool(&params.name) {
            return Err(McpError::ToolError {
                message: format!("Tool not found: {}", params.name),
            });
        }

        let arguments = params
            .arguments
            .unwrap_or(Value::Object(Default::default()));
        let result = self.surface.call(&params.name, arguments).await;
        serde_json::to_value(result).map_err(|e| McpError::InternalError {
            message: format!("failed to serialize tool result: {e}"),
        })
    }

    /// Route a JSON-RPC method to the appropriate handler.
    pub async fn route(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        match method {
            "initialize" => {
                let init_params: InitializeParams =
                    serde_json::from_value(params).map_err(|e| McpError::InvalidParams {
                        message: format!("invalid initialize params: {e}"),
                    })?;
                self.handle_initialize(init_params)
            }
            "notifications/initialized" => {
                info!("MCP client initialized");
                Ok(Value::Null)
            }
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => {
                let call_params: CallToolParams =
                    serde_json::from_value(params).map_err(|e| McpError::InvalidParams {
                        message: format!("invalid tools/call params: {e}"),
                    })?;
                self.handle_tools_call(call_params).await
            }
            _ => Err(McpError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }
}
