pub mod tools;

use rmcp::{
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router, ServerHandler,
};

use crate::api::AppState;
use crate::commands;

use tools::{ExecuteCommandParams, ForceTerminateParams, ListSessionsParams, ReadOutputParams};

#[derive(Clone)]
pub struct CmdrMcpServer {
    state: AppState,
    tool_router: ToolRouter<CmdrMcpServer>,
}

impl CmdrMcpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for CmdrMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "cmdr".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some(
                    "Run shell commands on the host with policy enforcement, background \
                     sessions, and incremental output polling."
                        .to_string(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use execute_command to run a shell command; it waits briefly and returns \
                 the PID with any initial output. If the command is still running, poll \
                 read_output with the PID for new output, force_terminate to stop it, and \
                 list_sessions to see everything currently tracked."
                    .to_string(),
            ),
        }
    }
}

#[tool_router]
impl CmdrMcpServer {
    #[tool(description = "Execute a shell command. Waits up to timeout_ms for completion, then returns the PID, the output so far, and whether the command is still running. Commands that outlive the wait keep running in the background; use read_output with the PID to collect more output. Every command in a &&/||/;/| chain must pass the server's allow/deny policy.")]
    async fn execute_command(
        &self,
        Parameters(params): Parameters<ExecuteCommandParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.state.telemetry.capture(
            "execute_command",
            serde_json::json!({ "base_command": commands::base_command(&params.command) }),
        );

        if !self.state.policy.validate(&params.command).await {
            return Err(ErrorData::invalid_params(
                format!("Command not allowed: {}", params.command),
                None,
            ));
        }

        let shell = self.state.config.resolve_shell(params.shell.as_deref());
        let result = self
            .state
            .manager
            .execute_command(&params.command, params.timeout_ms, &shell)
            .await;

        if result.pid < 0 {
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "Error: {}",
                result.output
            ))]));
        }

        let mut text = format!(
            "Command started with PID {}\nInitial output:\n{}",
            result.pid, result.output
        );
        if result.is_blocked {
            text.push_str("\nCommand is still running. Use read_output to get more output.");
        }
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(description = "Read new output from a running or recently finished command session. Returns only output produced since the last read; returns a note when nothing new is available or the PID is unknown.")]
    async fn read_output(
        &self,
        Parameters(params): Parameters<ReadOutputParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.state
            .telemetry
            .capture("read_output", serde_json::json!({ "pid": params.pid }));

        let text = match self.state.manager.get_new_output(params.pid) {
            None => format!("No session found for PID {}", params.pid),
            Some(output) if output.is_empty() => "No new output available".to_string(),
            Some(output) => output,
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(description = "Force terminate a running command session by PID. Sends SIGTERM to the whole process group and escalates to SIGKILL if it does not exit within the grace period.")]
    async fn force_terminate(
        &self,
        Parameters(params): Parameters<ForceTerminateParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.state
            .telemetry
            .capture("force_terminate", serde_json::json!({ "pid": params.pid }));

        let text = if self.state.manager.force_terminate(params.pid) {
            format!("Successfully initiated termination of session {}", params.pid)
        } else {
            format!("No active session found for PID {}", params.pid)
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(description = "List all tracked command sessions with their PID, blocked state, and runtime.")]
    async fn list_sessions(
        &self,
        Parameters(_params): Parameters<ListSessionsParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.state
            .telemetry
            .capture("list_sessions", serde_json::json!({}));

        let sessions = self.state.manager.list_active_sessions();
        let text = if sessions.is_empty() {
            "No active sessions".to_string()
        } else {
            sessions
                .iter()
                .map(|s| {
                    format!(
                        "PID: {}, Blocked: {}, Runtime: {}s",
                        s.pid,
                        s.is_blocked,
                        s.runtime_ms / 1000
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}
