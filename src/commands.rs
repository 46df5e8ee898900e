//! Command decomposition and allow/deny policy enforcement.
//!
//! Every command is gated here before it reaches the OS. A raw command string
//! is split into sub-commands on shell control operators, each sub-command is
//! reduced to its base executable token, and every token must pass the
//! configured policy. Policy rules may come from a source that is consulted
//! asynchronously (e.g. re-read from disk); if the source cannot answer
//! within its budget, validation fails closed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::config::{Config, PolicyConfig};

/// Wrapper programs stripped when resolving a sub-command's base token.
/// `sudo ls`, `env FOO=1 ls`, and `nohup ls` all classify as `ls`.
const WRAPPER_PREFIXES: &[&str] = &["sudo", "doas", "nohup", "env", "command"];

/// Split a raw command string into its constituent sub-commands.
///
/// Splits on `&&`, `||`, `;`, `|` and newlines, respecting single quotes,
/// double quotes, and backslash escapes so operators inside quotes are not
/// treated as separators. A lone `&` (background job) is not a separator.
///
/// Best-effort and infallible: malformed quoting falls back to treating the
/// whole string as one opaque sub-command, so validation still runs on it.
pub fn extract_commands(raw: &str) -> Vec<String> {
    match split_on_operators(raw) {
        Some(segments) => segments,
        None => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        }
    }
}

/// The base executable token of the first sub-command, for coarse
/// classification. Empty string if the command has no token.
pub fn base_command(raw: &str) -> String {
    extract_commands(raw)
        .first()
        .map(|segment| base_token(segment))
        .unwrap_or_default()
}

/// Quote-aware operator split. Returns `None` on malformed quoting
/// (unterminated quote), letting the caller fall back to the opaque form.
fn split_on_operators(raw: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                // Escape: keep the backslash and the escaped char verbatim.
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '&' if !in_single && !in_double && chars.peek() == Some(&'&') => {
                chars.next();
                push_segment(&mut segments, &mut current);
            }
            '|' if !in_single && !in_double => {
                // `||` and `|` are both separators; consume the second bar.
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                push_segment(&mut segments, &mut current);
            }
            ';' | '\n' if !in_single && !in_double => {
                push_segment(&mut segments, &mut current);
            }
            _ => current.push(c),
        }
    }

    if in_single || in_double {
        return None;
    }
    push_segment(&mut segments, &mut current);
    Some(segments)
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
    current.clear();
}

/// Resolve a single sub-command's base executable token: skip leading
/// environment assignments and wrapper prefixes (plus their flags), then
/// strip any path prefix from the program word.
fn base_token(segment: &str) -> String {
    let mut after_wrapper = false;
    for word in segment.split_whitespace() {
        if is_env_assignment(word) {
            continue;
        }
        if WRAPPER_PREFIXES.contains(&word) {
            after_wrapper = true;
            continue;
        }
        if after_wrapper && word.starts_with('-') {
            // e.g. `sudo -u root ls`, `env -i ls`
            continue;
        }
        return word.rsplit('/').next().unwrap_or(word).to_string();
    }
    String::new()
}

/// True for `KEY=value` words with a shell-variable-shaped key.
fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((key, _)) => {
            !key.is_empty()
                && key
                    .chars()
                    .enumerate()
                    .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        }
        None => false,
    }
}

/// Immutable allow/deny rule set, evaluated per base token.
#[derive(Debug, Clone, Default)]
pub struct PolicyRules {
    allowed: Vec<String>,
    blocked: Vec<String>,
}

impl PolicyRules {
    pub fn new(allowed: Vec<String>, blocked: Vec<String>) -> Self {
        Self { allowed, blocked }
    }

    pub fn from_config(policy: &PolicyConfig) -> Self {
        Self::new(policy.allowed_commands.clone(), policy.blocked_commands.clone())
    }

    /// Whether a single base token passes this rule set.
    ///
    /// Deny wins; an entry in the allow set ending in `*` matches by prefix;
    /// an empty allow set permits everything not blocked.
    pub fn permits(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        if self.blocked.iter().any(|entry| entry == token) {
            return false;
        }
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed.iter().any(|entry| match entry.strip_suffix('*') {
            Some(prefix) => token.starts_with(prefix),
            None => entry == token,
        })
    }
}

/// Where current policy rules come from.
///
/// `Static` holds rules fixed at construction; `File` re-reads the config
/// file so policy edits take effect without a restart.
#[derive(Debug, Clone)]
pub enum PolicySource {
    Static(PolicyRules),
    File(FilePolicy),
}

impl PolicySource {
    async fn rules(&self) -> Result<PolicyRules, PolicyError> {
        match self {
            PolicySource::Static(rules) => Ok(rules.clone()),
            PolicySource::File(file) => file.rules().await,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse policy file {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

/// Policy rules backed by the TOML config file, cached by mtime.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    path: PathBuf,
    cache: Arc<RwLock<Option<(SystemTime, PolicyRules)>>>,
}

impl FilePolicy {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    async fn rules(&self) -> Result<PolicyRules, PolicyError> {
        let mtime = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| PolicyError::ReadFailed(self.path.clone(), e))?;

        if let Some((cached_mtime, ref rules)) = *self.cache.read() {
            if cached_mtime == mtime {
                return Ok(rules.clone());
            }
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PolicyError::ReadFailed(self.path.clone(), e))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| PolicyError::ParseFailed(self.path.clone(), e))?;
        let rules = PolicyRules::from_config(&config.policy);
        *self.cache.write() = Some((mtime, rules.clone()));
        Ok(rules)
    }
}

/// The validation gate in front of the terminal manager.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    source: PolicySource,
    consult_timeout: Duration,
}

impl CommandPolicy {
    pub fn new(source: PolicySource, consult_timeout: Duration) -> Self {
        Self {
            source,
            consult_timeout,
        }
    }

    /// Fixed in-memory rules (tests, or configs without a backing file).
    pub fn from_rules(rules: PolicyRules) -> Self {
        Self::new(
            PolicySource::Static(rules),
            Duration::from_millis(500),
        )
    }

    /// Whether every sub-command of `raw` passes the current policy.
    ///
    /// Fail-closed: an empty command, a policy source error, or a source
    /// consultation that exceeds the configured budget all deny.
    pub async fn validate(&self, raw: &str) -> bool {
        if raw.trim().is_empty() {
            return false;
        }

        let rules = match tokio::time::timeout(self.consult_timeout, self.source.rules()).await {
            Ok(Ok(rules)) => rules,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "policy source failed, denying command");
                return false;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.consult_timeout.as_millis() as u64,
                    "policy source timed out, denying command"
                );
                return false;
            }
        };

        extract_commands(raw)
            .iter()
            .all(|segment| rules.permits(&base_token(segment)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- extraction ----

    #[test]
    fn extract_single_command() {
        assert_eq!(extract_commands("ls -la"), vec!["ls -la"]);
    }

    #[test]
    fn extract_splits_on_every_operator() {
        let segments = extract_commands("a && b || c ; d | e");
        assert_eq!(segments, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn extract_preserves_source_order() {
        let segments = extract_commands("make build && make test; make install");
        assert_eq!(segments, vec!["make build", "make test", "make install"]);
    }

    #[test]
    fn extract_respects_double_quotes() {
        let segments = extract_commands(r#"echo "a && b" && ls"#);
        assert_eq!(segments, vec![r#"echo "a && b""#, "ls"]);
    }

    #[test]
    fn extract_respects_single_quotes() {
        let segments = extract_commands("echo 'x | y; z'");
        assert_eq!(segments, vec!["echo 'x | y; z'"]);
    }

    #[test]
    fn extract_respects_escapes() {
        let segments = extract_commands(r"echo a\;b; ls");
        assert_eq!(segments, vec![r"echo a\;b", "ls"]);
    }

    #[test]
    fn extract_splits_on_newlines() {
        let segments = extract_commands("cd /tmp\nls");
        assert_eq!(segments, vec!["cd /tmp", "ls"]);
    }

    #[test]
    fn extract_background_ampersand_is_not_a_separator() {
        let segments = extract_commands("sleep 10 & echo done");
        assert_eq!(segments, vec!["sleep 10 & echo done"]);
    }

    #[test]
    fn extract_malformed_quote_falls_back_to_opaque() {
        let segments = extract_commands("echo 'unterminated && rm -rf /");
        assert_eq!(segments, vec!["echo 'unterminated && rm -rf /"]);
    }

    #[test]
    fn extract_empty_is_empty() {
        assert!(extract_commands("").is_empty());
        assert!(extract_commands("   ").is_empty());
    }

    #[test]
    fn extract_drops_empty_segments() {
        assert_eq!(extract_commands("ls;;echo ok"), vec!["ls", "echo ok"]);
    }

    // ---- base token ----

    #[test]
    fn base_command_first_token() {
        assert_eq!(base_command("git status && ls"), "git");
    }

    #[test]
    fn base_token_strips_env_assignments() {
        assert_eq!(base_command("FOO=1 BAR=2 make all"), "make");
    }

    #[test]
    fn base_token_strips_wrapper_prefixes() {
        assert_eq!(base_command("sudo rm -rf /tmp/x"), "rm");
        assert_eq!(base_command("env FOO=1 python3 x.py"), "python3");
        assert_eq!(base_command("sudo -u root systemctl restart foo"), "systemctl");
    }

    #[test]
    fn base_token_strips_path_prefix() {
        assert_eq!(base_command("/usr/bin/curl -s http://x"), "curl");
    }

    #[test]
    fn base_command_empty() {
        assert_eq!(base_command(""), "");
    }

    // ---- rules ----

    #[test]
    fn rules_deny_wins_over_allow() {
        let rules = PolicyRules::new(vec!["rm".into()], vec!["rm".into()]);
        assert!(!rules.permits("rm"));
    }

    #[test]
    fn rules_empty_allow_permits_by_default() {
        let rules = PolicyRules::new(vec![], vec!["mkfs".into()]);
        assert!(rules.permits("ls"));
        assert!(!rules.permits("mkfs"));
    }

    #[test]
    fn rules_allow_prefix_wildcard() {
        let rules = PolicyRules::new(vec!["git*".into(), "ls".into()], vec![]);
        assert!(rules.permits("git"));
        assert!(rules.permits("gitk"));
        assert!(rules.permits("ls"));
        assert!(!rules.permits("lsd"));
        assert!(!rules.permits("cat"));
    }

    #[test]
    fn rules_empty_token_denied() {
        assert!(!PolicyRules::default().permits(""));
    }

    // ---- validation ----

    fn policy(allowed: &[&str], blocked: &[&str]) -> CommandPolicy {
        CommandPolicy::from_rules(PolicyRules::new(
            allowed.iter().map(|s| s.to_string()).collect(),
            blocked.iter().map(|s| s.to_string()).collect(),
        ))
    }

    #[tokio::test]
    async fn validate_denies_blocked_anywhere_in_chain() {
        let p = policy(&[], &["rm"]);
        assert!(!p.validate("ls -la && rm -rf /").await);
        assert!(!p.validate("echo hi | rm -rf /").await);
        assert!(p.validate("ls -la && echo ok").await);
    }

    #[tokio::test]
    async fn validate_denies_empty_command() {
        let p = policy(&[], &[]);
        assert!(!p.validate("").await);
        assert!(!p.validate("   ").await);
    }

    #[tokio::test]
    async fn validate_denies_wrapped_blocked_command() {
        let p = policy(&[], &["rm"]);
        assert!(!p.validate("sudo rm -rf /").await);
        assert!(!p.validate("FOO=1 /bin/rm x").await);
    }

    #[tokio::test]
    async fn validate_malformed_quoting_still_evaluated() {
        // The opaque fallback segment's base token is still `echo`; a policy
        // that only allows `ls` rejects it rather than letting it slip by.
        let p = policy(&["ls"], &[]);
        assert!(!p.validate("echo 'unterminated && ls").await);
    }

    #[tokio::test]
    async fn validate_allow_set_restricts() {
        let p = policy(&["ls", "echo"], &[]);
        assert!(p.validate("ls && echo ok").await);
        assert!(!p.validate("ls && cat /etc/passwd").await);
    }

    #[tokio::test]
    async fn validate_missing_policy_file_fails_closed() {
        let p = CommandPolicy::new(
            PolicySource::File(FilePolicy::new("/nonexistent/cmdr/policy.toml".into())),
            Duration::from_millis(500),
        );
        assert!(!p.validate("ls").await);
    }

    #[tokio::test]
    async fn file_policy_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[policy]\nblocked_commands = []\n").unwrap();

        let p = CommandPolicy::new(
            PolicySource::File(FilePolicy::new(path.clone())),
            Duration::from_millis(500),
        );
        assert!(p.validate("rm -rf /tmp/x").await);

        // Rewrite the policy; the sleep guarantees a distinct mtime even on
        // coarse filesystem timestamp resolutions.
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&path, "[policy]\nblocked_commands = [\"rm\"]\n").unwrap();

        assert!(!p.validate("rm -rf /tmp/x").await);
    }
}
