use crate::config::Config;
use crate::error::AppError;
use crate::mcp::schemas::*;
use crate::tools::{
    filesystem_tool::{
        CreateDirectoryParams, DeletePathParams, FilesystemManager, ListDirectoryParams, ReadFileParams,
        RenamePathParams, WriteFileParams,
    },
    session_tool::{ConnectParams, ReplSendParams, RunCodeParams, SaveAndRunParams, SessionManager},
    terminal_tool::{ReadTerminalParams, TerminalCommandParams, TerminalManager},
};
use crate::utils::audit_logger::AuditLogger;

use async_trait::async_trait;
use rust_mcp_schema::{
    schema_utils::CallToolError, CallToolRequest, CallToolResult, ListToolsRequest, ListToolsResult, RpcError, Tool,
};
use rust_mcp_sdk::{mcp_server::ServerHandler, McpServer};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Name, description and input schema of every exposed tool.
pub fn tool_definitions() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        // Config
        ("get_config", "Get the current bridge configuration.", empty_schema()),
        // Session
        ("device_connect", "Open the serial connection to the MicroPython board and sync to its >>> prompt.", device_connect_schema()),
        ("device_disconnect", "Close the serial connection.", empty_schema()),
        ("device_status", "Connection state, interpreter mode and board identification.", empty_schema()),
        ("run_code", "Run MicroPython code in raw mode and return what it printed. Fails with Busy while another run is in progress.", run_code_schema()),
        ("save_and_run", "Store a program on the device (main.py by default) and run it.", save_and_run_schema()),
        ("stop_program", "Interrupt the running program and return to the >>> prompt.", empty_schema()),
        ("soft_reset", "Soft-reboot the interpreter.", empty_schema()),
        ("repl_send", "Send one line to the interactive prompt. Output shows up in read_terminal.", repl_send_schema()),
        // Terminal
        ("terminal_command", "Type a line into the terminal, including local commands like status or :raw.", terminal_command_schema()),
        ("read_terminal", "Read the terminal transcript.", read_terminal_schema()),
        // Filesystem
        ("list_directory", "List a directory on the device, directories first.", list_directory_schema()),
        ("read_file", "Read a file from the device.", read_file_schema()),
        ("write_file", "Write a file to the device.", write_file_schema()),
        ("delete_path", "Delete a file or empty directory on the device.", delete_path_schema()),
        ("create_directory", "Create a directory on the device.", create_directory_schema()),
        ("rename_path", "Rename or move a file or directory on the device.", rename_path_schema()),
    ]
}

fn text_result(text: String, is_error: bool) -> Result<CallToolResult, CallToolError> {
    serde_json::from_value(json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    }))
    .map_err(|e| CallToolError::new(AppError::SerdeJsonError(e)))
}

pub struct AppManagers {
    config: Arc<Config>,
    session_manager: Arc<SessionManager>,
    filesystem_manager: Arc<FilesystemManager>,
    terminal_manager: Arc<TerminalManager>,
}

impl AppManagers {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_session(config.clone(), Arc::new(SessionManager::new(config)))
    }

    pub fn with_session(config: Arc<Config>, session_manager: Arc<SessionManager>) -> Self {
        let filesystem_manager = Arc::new(FilesystemManager::new(session_manager.clone()));
        let terminal_manager = Arc::new(TerminalManager::new(session_manager.clone()));
        Self {
            config,
            session_manager,
            filesystem_manager,
            terminal_manager,
        }
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// Runs one tool and returns its JSON result. `None` for an unknown tool name.
    pub async fn dispatch(&self, name: &str, args: Map<String, Value>) -> Option<Result<Value, AppError>> {
        macro_rules! handle_tool {
            ($manager_field:ident . $method:ident :: <$param_type:ty>) => {
                async {
                    let params: $param_type = serde_json::from_value(Value::Object(args))
                        .map_err(|e| AppError::InvalidInputArgument(e.to_string()))?;
                    let result = self.$manager_field.$method(&params).await?;
                    Ok::<Value, AppError>(serde_json::to_value(result)?)
                }
                .await
            };
            ($manager_field:ident . $method:ident ()) => {
                async {
                    let result = self.$manager_field.$method().await?;
                    Ok::<Value, AppError>(serde_json::to_value(result)?)
                }
                .await
            };
        }

        let outcome = match name {
            // Config
            "get_config" => serde_json::to_value(self.config.as_ref()).map_err(AppError::from),
            // Session
            "device_connect" => handle_tool!(session_manager.connect::<ConnectParams>),
            "device_disconnect" => handle_tool!(session_manager.disconnect()),
            "device_status" => serde_json::to_value(self.session_manager.status().await).map_err(AppError::from),
            "run_code" => handle_tool!(session_manager.run::<RunCodeParams>),
            "save_and_run" => handle_tool!(session_manager.save_and_run::<SaveAndRunParams>),
            "stop_program" => handle_tool!(session_manager.stop()),
            "soft_reset" => handle_tool!(session_manager.soft_reset()),
            "repl_send" => handle_tool!(session_manager.send_repl_line::<ReplSendParams>),
            // Terminal
            "terminal_command" => handle_tool!(terminal_manager.terminal_command::<TerminalCommandParams>),
            "read_terminal" => handle_tool!(terminal_manager.read_terminal::<ReadTerminalParams>),
            // Filesystem
            "list_directory" => handle_tool!(filesystem_manager.list_directory::<ListDirectoryParams>),
            "read_file" => handle_tool!(filesystem_manager.read_file::<ReadFileParams>),
            "write_file" => handle_tool!(filesystem_manager.write_file::<WriteFileParams>),
            "delete_path" => handle_tool!(filesystem_manager.delete_path::<DeletePathParams>),
            "create_directory" => handle_tool!(filesystem_manager.create_directory::<CreateDirectoryParams>),
            "rename_path" => handle_tool!(filesystem_manager.rename_path::<RenamePathParams>),
            _ => return None,
        };
        Some(outcome)
    }
}

pub struct DeviceServerHandler {
    managers: Arc<AppManagers>,
    audit_logger: AuditLogger,
}

impl DeviceServerHandler {
    pub fn new(config: Arc<Config>) -> Self {
        let audit_logger = AuditLogger::new(&config);
        Self {
            managers: Arc::new(AppManagers::new(config)),
            audit_logger,
        }
    }
}

#[async_trait]
impl ServerHandler for DeviceServerHandler {
    #[instrument(skip(self, _request, _runtime))]
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        _runtime: &dyn McpServer,
    ) -> Result<ListToolsResult, RpcError> {
        info!("Handling list_tools request");
        let tools = tool_definitions()
            .into_iter()
            .map(|(name, description, input_schema)| {
                serde_json::from_value::<Tool>(json!({
                    "name": name,
                    "description": description,
                    "inputSchema": input_schema
                }))
                .map_err(|e| RpcError::internal_error().with_message(format!("Invalid schema for {}: {}", name, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ListToolsResult {
            tools,
            meta: None,
            next_cursor: None,
        })
    }

    #[instrument(skip(self, request, _runtime), fields(tool_name = %request.params.name))]
    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        _runtime: &dyn McpServer,
    ) -> Result<CallToolResult, CallToolError> {
        let name = request.params.name.clone();
        info!("Handling call_tool request for: {}", name);
        let args = request.params.arguments.unwrap_or_default();
        let logged_args = Value::Object(args.clone());

        let Some(outcome) = self.managers.dispatch(&name, args).await else {
            error!("Unknown tool called: {}", name);
            self.audit_logger.log_tool_call(&name, &logged_args, "unknown").await;
            return Err(CallToolError::unknown_tool(name));
        };

        match outcome {
            Ok(value) => {
                self.audit_logger.log_tool_call(&name, &logged_args, "ok").await;
                let text = serde_json::to_string_pretty(&value).map_err(AppError::from)?;
                debug!(tool = %name, result_len = text.len(), "Tool succeeded");
                text_result(text, false)
            }
            Err(e) => {
                self.audit_logger.log_tool_call(&name, &logged_args, "error").await;
                error!(tool = %name, error = %e, "Tool failed");
                text_result(e.to_string(), true)
            }
        }
    }
}
