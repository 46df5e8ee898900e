//! cmdr - validated, asynchronous shell command execution for AI agents.
//!
//! Exposes an MCP server (stdio or Streamable HTTP) with four tools:
//! `execute_command` spawns a shell command and waits briefly for it to
//! finish, `read_output` polls a still-running command for new output,
//! `force_terminate` stops one, and `list_sessions` shows what is tracked.
//! Every command is checked against a configurable allow/deny policy before
//! it reaches the OS.

pub mod api;
pub mod commands;
pub mod config;
pub mod manager;
pub mod mcp;
pub mod session;
pub mod telemetry;
