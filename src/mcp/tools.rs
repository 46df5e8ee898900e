// MCP tool parameter types

use serde::Deserialize;

/// Default initial wait window for `execute_command`, in milliseconds.
pub fn default_timeout_ms() -> u64 {
    2_000
}

/// Parameters for the `execute_command` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ExecuteCommandParams {
    /// The shell command to run.
    #[schemars(description = "The shell command to execute. May contain pipes and &&/||/; chains; every command in the chain must pass the configured allow/deny policy.")]
    pub command: String,

    /// How long to wait for completion before returning with is_blocked.
    #[serde(default = "default_timeout_ms")]
    #[schemars(description = "Milliseconds to wait for the command to finish before returning early. Defaults to 2000, capped at 300000. Long-running commands keep running; poll them with read_output.")]
    pub timeout_ms: u64,

    /// Interpreter override. Defaults to the configured shell.
    #[schemars(description = "Shell to run the command with (e.g. /bin/bash). Defaults to the server's configured shell.")]
    pub shell: Option<String>,
}

/// Parameters for the `read_output` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ReadOutputParams {
    /// PID returned by `execute_command`.
    #[schemars(description = "The PID of the session to read, as returned by execute_command.")]
    pub pid: u32,
}

/// Parameters for the `force_terminate` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ForceTerminateParams {
    /// PID returned by `execute_command`.
    #[schemars(description = "The PID of the session to terminate.")]
    pub pid: u32,
}

/// Parameters for the `list_sessions` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListSessionsParams {}
