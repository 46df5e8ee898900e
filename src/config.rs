use serde::{Deserialize, Serialize};

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Interpreter used when a request doesn't name one. Falls back to
    /// `$SHELL`, then `/bin/sh`.
    pub default_shell: Option<String>,
    /// Command allow/deny policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Session lifecycle limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Usage telemetry reporting.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// The `[policy]` section: allow/deny sets for command base tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Allowed base tokens. An entry ending in `*` is a prefix match.
    /// Empty or absent means every command not explicitly blocked is allowed.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Blocked base tokens. Deny always wins over allow.
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// Budget for consulting the policy source. If rules cannot be produced
    /// within this window, validation fails closed (deny).
    #[serde(default = "default_consult_timeout_ms")]
    pub consult_timeout_ms: u64,
}

fn default_consult_timeout_ms() -> u64 {
    500
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            blocked_commands: Vec::new(),
            consult_timeout_ms: default_consult_timeout_ms(),
        }
    }
}

/// The `[limits]` section: registry caps and grace periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrently tracked sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// How long an exited session stays queryable before it is reaped.
    #[serde(default = "default_reap_grace_ms")]
    pub reap_grace_ms: u64,
    /// How long after SIGTERM before force-terminate escalates to SIGKILL.
    #[serde(default = "default_term_grace_ms")]
    pub term_grace_ms: u64,
}

fn default_max_sessions() -> usize {
    128
}

fn default_reap_grace_ms() -> u64 {
    5_000
}

fn default_term_grace_ms() -> u64 {
    3_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            reap_grace_ms: default_reap_grace_ms(),
            term_grace_ms: default_term_grace_ms(),
        }
    }
}

/// The `[telemetry]` section. Disabled unless explicitly enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HTTP endpoint events are POSTed to. Required when enabled.
    pub endpoint: Option<String>,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-writable.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the policy file can be edited by anyone on the host.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Default config file location: `$XDG_CONFIG_HOME/cmdr/config.toml`.
    pub fn default_path() -> std::path::PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("cmdr")
            .join("config.toml")
    }

    /// Resolve the interpreter to launch a command under.
    ///
    /// Precedence: per-request shell, then config `default_shell`, then
    /// `$SHELL`, then `/bin/sh`.
    pub fn resolve_shell(&self, requested: Option<&str>) -> String {
        if let Some(shell) = requested {
            return shell.to_string();
        }
        if let Some(ref shell) = self.default_shell {
            return shell.clone();
        }
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(std::path::PathBuf, #[source] toml::de::Error),
    #[error("failed to write config {0}: {1}")]
    WriteFailed(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[source] toml::ser::Error),
}

/// Check file permissions on a config file and warn if world-writable.
///
/// On Unix, checks `st_mode & 0o002`. The config file is the command policy:
/// if any local user can edit it, the allow/deny sets can be tampered with.
#[cfg(unix)]
pub fn check_config_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return, // File doesn't exist or can't be read; nothing to warn about.
    };

    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            "Config file {} is world-writable (mode {:o}). \
             It holds the command policy -- consider restricting permissions to 644 or tighter.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &std::path::Path) {}

/// Returns true if the given file mode has the world-writable bit set.
///
/// This is a pure helper for testing; it does NOT read the filesystem.
#[cfg(unix)]
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}
