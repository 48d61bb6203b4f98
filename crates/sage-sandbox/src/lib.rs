use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

/// Destructive command fragments, matched case-insensitively anywhere in the
/// command line after whitespace runs are collapsed to one space.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    "of=/dev/",
    "mkfs",
    "$(",
    "`",
    ":(){",
    ":() {",
];

const RECURSIVE_DELETE: &str = "recursive change of a system path";
const PRIVILEGE_ESCALATION: &str = "privilege escalation";
const SYSTEM_WRITE: &str = "write into a system path";

/// Commands that are dangerous with a recursive flag on a protected path.
const RECURSIVE_COMMANDS: &[&str] = &["rm", "chmod", "chown", "chgrp", "shred"];
const PRIVILEGE_COMMANDS: &[&str] = &["sudo", "doas", "su", "pkexec", "runuser"];
/// Words that run the next word as a command.
const COMMAND_WRAPPERS: &[&str] = &[
    "!", "command", "do", "else", "env", "exec", "if", "nice", "nohup", "then", "time", "timeout",
    "until", "while", "xargs",
];

const PROTECTED_PATHS: &[&str] = &[
    "~", "$home", "${home}", "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/lib64", "/opt",
    "/proc", "/root", "/sbin", "/srv", "/sys", "/usr", "/var",
];

/// `>`, `>>` or `>|` into a system directory or a raw disk, with or without a space.
static SYSTEM_REDIRECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#">{1,2}\|?\s*["']?(?:/dev/(?:sd|hd|vd|nvme|mmcblk|disk)|/(?:etc|boot|usr|bin|sbin|lib|lib64|sys|proc)\b)"#,
    )
    .expect("system redirect pattern is valid")
});

static SYSTEM_TEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\btee\b[^;&|]*\s["']?/(?:etc|boot|usr|bin|sbin|lib|lib64)\b"#)
        .expect("tee pattern is valid")
});

const CREDENTIAL_MARKERS: &[&str] = &[
    "KEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "CREDENTIAL",
    "AUTH",
];

const CREDENTIAL_PREFIXES: &[&str] = &[
    "AWS_",
    "AZURE_",
    "GCP_",
    "GOOGLE_",
    "OPENAI_",
    "ANTHROPIC_",
    "GITHUB_",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub max_runtime_secs: u64,
    pub max_output_bytes: usize,
    pub sanitize_env: bool,
    pub deny_patterns: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            max_runtime_secs: 30,
            max_output_bytes: 64 * 1024,
            sanitize_env: true,
            deny_patterns: DEFAULT_DENY_PATTERNS.iter().map(|p| (*p).to_owned()).collect(),
        }
    }
}

impl SandboxPolicy {
    /// First deny pattern or built-in rule that `command` trips, if any.
    pub fn blocked_pattern(&self, command: &str) -> Option<&str> {
        let normalized = normalize(command);
        if let Some(pattern) = self
            .deny_patterns
            .iter()
            .find(|pattern| normalized.contains(&normalize(pattern)))
        {
            return Some(pattern.as_str());
        }
        builtin_rule(&normalized)
    }
}

/// Lowercased with every whitespace run collapsed to a single space.
fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn builtin_rule(normalized: &str) -> Option<&'static str> {
    if SYSTEM_REDIRECT.is_match(normalized) || SYSTEM_TEE.is_match(normalized) {
        return Some(SYSTEM_WRITE);
    }
    for segment in normalized.split([';', '&', '|', '\n', '(', ')', '{', '}']) {
        let words: Vec<String> = segment.split_whitespace().map(unquote).collect();
        if words.iter().enumerate().any(|(at, word)| {
            RECURSIVE_COMMANDS.contains(&program(word)) && recursive_on_protected(&words[at + 1..])
        }) {
            return Some(RECURSIVE_DELETE);
        }
        if command_words(&words).any(|word| PRIVILEGE_COMMANDS.contains(&program(word))) {
            return Some(PRIVILEGE_ESCALATION);
        }
    }
    None
}

/// Strips quotes and backslash escapes, so `"sudo"` and `s\udo` read as `sudo`.
fn unquote(word: &str) -> String {
    word.chars()
        .filter(|c| !matches!(c, '"' | '\'' | '\\'))
        .collect()
}

/// `/usr/bin/sudo` -> `sudo`.
fn program(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

/// The word the shell runs, plus whatever a wrapper such as `env` or `nohup` runs.
fn command_words(words: &[String]) -> impl Iterator<Item = &String> {
    let mut expect_command = true;
    words.iter().filter(move |word| {
        if !expect_command {
            return false;
        }
        let assignment = word.contains('=') && !word.starts_with('=');
        let numeric = word.chars().all(|c| c.is_ascii_digit() || c == '.');
        if assignment || numeric || word.starts_with('-') {
            return false;
        }
        expect_command = COMMAND_WRAPPERS.contains(&program(word));
        true
    })
}

fn recursive_on_protected(args: &[String]) -> bool {
    let mut recursive = false;
    let mut protected = false;
    for arg in args {
        match arg.as_str() {
            "--recursive" | "--no-preserve-root" => recursive = true,
            long if long.starts_with("--") => {}
            short if short.starts_with('-') && short.len() > 1 => {
                recursive |= short.contains('r');
            }
            target => protected |= is_protected_path(target),
        }
    }
    recursive && protected
}

fn is_protected_path(target: &str) -> bool {
    let trimmed = target.trim_end_matches(['*', '/']);
    if trimmed.is_empty() {
        return target.starts_with('/');
    }
    PROTECTED_PATHS.contains(&trimmed)
}

/// True for variable names that look like they carry credentials.
pub fn is_credential_var(name: &str) -> bool {
    let upper = name.to_uppercase();
    CREDENTIAL_PREFIXES
        .iter()
        .any(|prefix| upper.starts_with(prefix))
        || CREDENTIAL_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Copy of `vars` without credential-like names.
pub fn sanitized_env(vars: impl IntoIterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter(|(name, _)| !is_credential_var(name))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Shell command line, run through `sh -c`.
    pub command: String,
    pub cwd: Option<PathBuf>,
}

impl SandboxRequest {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl SandboxExecution {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, the way a tool reports it back.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim_end().is_empty(), self.stderr.trim_end().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("command blocked by sandbox policy (matched `{pattern}`)")]
    Blocked { pattern: String },
    #[error("command timed out after {0}s")]
    Timeout(u64),
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution, SandboxError>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalSandboxRunner {
    policy: SandboxPolicy,
    /// Environment handed to children instead of the process environment.
    base_env: Option<BTreeMap<String, String>>,
}

impl LocalSandboxRunner {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self {
            policy,
            base_env: None,
        }
    }

    pub fn with_base_env(mut self, vars: BTreeMap<String, String>) -> Self {
        self.base_env = Some(vars);
        self
    }

    fn child_env(&self) -> Option<BTreeMap<String, String>> {
        let vars: Vec<(String, String)> = match &self.base_env {
            Some(vars) => vars.clone().into_iter().collect(),
            None if self.policy.sanitize_env => std::env::vars().collect(),
            None => return None,
        };
        Some(if self.policy.sanitize_env {
            sanitized_env(vars)
        } else {
            vars.into_iter().collect()
        })
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Cut `output` to `max_output_bytes`, noting how much was dropped.
    fn truncate(output: Vec<u8>, max_output_bytes: usize) -> (String, bool) {
        if output.len() <= max_output_bytes {
            return (String::from_utf8_lossy(&output).into_owned(), false);
        }
        let omitted = output.len() - max_output_bytes;
        let mut text = String::from_utf8_lossy(&output[..max_output_bytes]).into_owned();
        text.push_str(&format!("\n[output truncated: {omitted} bytes omitted]"));
        (text, true)
    }
}

#[async_trait]
impl SandboxRunner for LocalSandboxRunner {
    #[instrument(
        skip(self, request),
        fields(
            command_len = request.command.len(),
            sanitize_env = self.policy.sanitize_env
        )
    )]
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution, SandboxError> {
        if let Some(pattern) = self.policy.blocked_pattern(&request.command) {
            warn!(pattern, "sandbox rejected command");
            return Err(SandboxError::Blocked {
                pattern: pattern.to_owned(),
            });
        }

        let started_at = Utc::now();

        let mut command = Command::new("sh");
        command.arg("-c").arg(&request.command);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = self.child_env() {
            command.env_clear();
            command.envs(env);
        }
        command.kill_on_drop(true);

        let limit = Duration::from_secs(self.policy.max_runtime_secs.max(1));
        let output = match timeout(limit, command.output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    max_runtime_secs = self.policy.max_runtime_secs,
                    "sandbox command timed out"
                );
                return Err(SandboxError::Timeout(self.policy.max_runtime_secs));
            }
        };

        let ended_at = Utc::now();
        let (stdout, out_truncated) = Self::truncate(output.stdout, self.policy.max_output_bytes);
        let (stderr, err_truncated) = Self::truncate(output.stderr, self.policy.max_output_bytes);
        let execution = SandboxExecution {
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
            truncated: out_truncated || err_truncated,
        };
        debug!(
            exit_code = execution.exit_code,
            duration_ms = execution.duration_ms,
            truncated = execution.truncated,
            "sandbox command finished"
        );
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_default_pattern_is_blocked() {
        let policy = SandboxPolicy::default();
        for pattern in DEFAULT_DENY_PATTERNS {
            let command = format!("echo start; {pattern} tail");
            assert!(
                policy.blocked_pattern(&command).is_some(),
                "expected `{command}` to be blocked"
            );
        }
    }

    #[test]
    fn matching_ignores_case() {
        let policy = SandboxPolicy::default();
        assert!(policy.blocked_pattern("SUDO reboot").is_some());
        assert!(policy.blocked_pattern("RM -RF /").is_some());
        assert!(policy.blocked_pattern("ls -la").is_none());
    }

    #[test]
    fn rewritten_dangerous_commands_are_blocked() {
        let policy = SandboxPolicy::default();
        for command in [
            "rm  -rf /",
            "rm -r -f /",
            "rm --recursive --force /",
            "rm -Rf ~",
            "rm -rf \"$HOME\"",
            "/bin/rm -fr /boot/",
            "rm -rf /usr",
            "rm -r /*",
            "chmod -R 777 /",
            "sudo\tls",
            "ls; doas reboot",
            "FOO=1 sudo ls",
            "env sudo ls",
            "timeout 5 sudo ls",
            "\"sudo\" ls",
            "su root",
            "echo x >/etc/passwd",
            "echo x>>/etc/hosts",
            "echo x >  /usr/bin/ls",
            "cat image > /dev/sda",
            "echo hi | tee /etc/motd",
        ] {
            assert!(
                policy.blocked_pattern(command).is_some(),
                "expected `{command}` to be blocked"
            );
        }
    }

    #[test]
    fn harmless_commands_pass() {
        let policy = SandboxPolicy::default();
        for command in [
            "echo \"rm is a command\"",
            "ls /etc",
            "ls -la /usr/bin",
            "rm -rf ./build",
            "rm -rf target/debug",
            "cat /etc/hosts > out.txt",
            "echo hi 2>/dev/null",
            "grep -r sudo docs",
            "echo done && ls",
        ] {
            assert_eq!(
                policy.blocked_pattern(command),
                None,
                "expected `{command}` to pass"
            );
        }
    }

    #[test]
    fn credential_names_are_detected() {
        for name in [
            "OPENAI_API_KEY",
            "github_token",
            "DB_PASSWORD",
            "AWS_REGION",
            "MY_SECRET",
        ] {
            assert!(is_credential_var(name), "{name} should be stripped");
        }
        for name in ["PATH", "HOME", "LANG", "TERM"] {
            assert!(!is_credential_var(name), "{name} should be kept");
        }
    }

    #[test]
    fn truncation_appends_notice() {
        let (text, truncated) = LocalSandboxRunner::truncate(b"abcdefghij".to_vec(), 4);
        assert!(truncated);
        assert_eq!(text, "abcd\n[output truncated: 6 bytes omitted]");

        let (text, truncated) = LocalSandboxRunner::truncate(b"abc".to_vec(), 4);
        assert!(!truncated);
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn blocked_command_never_spawns() {
        let marker = std::env::temp_dir().join(format!(
            "sage-sandbox-marker-{}",
            std::process::id()
        ));
        let runner = LocalSandboxRunner::default();
        let command = format!("touch {} && sudo true", marker.display());
        let err = runner.run(SandboxRequest::shell(command)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Blocked { .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn runs_command_and_captures_output() {
        let runner = LocalSandboxRunner::default();
        let execution = runner
            .run(SandboxRequest::shell("echo hello"))
            .await
            .unwrap();
        assert!(execution.success());
        assert_eq!(execution.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn sanitized_env_hides_credentials_from_subprocess() {
        let mut vars: BTreeMap<String, String> = std::env::vars().collect();
        vars.insert("SAGE_TEST_API_KEY".to_owned(), "hunter2".to_owned());
        vars.insert("SAGE_TEST_GREETING".to_owned(), "hello".to_owned());
        let runner = LocalSandboxRunner::default().with_base_env(vars);
        let execution = runner
            .run(SandboxRequest::shell("env"))
            .await
            .unwrap();
        assert!(!execution.stdout.contains("SAGE_TEST_API_KEY"));
        assert!(!execution.stdout.contains("hunter2"));
        assert!(execution.stdout.contains("SAGE_TEST_GREETING=hello"));
    }

    #[tokio::test]
    async fn timeout_kills_long_running_command() {
        let runner = LocalSandboxRunner::new(SandboxPolicy {
            max_runtime_secs: 1,
            ..SandboxPolicy::default()
        });
        let err = runner
            .run(SandboxRequest::shell("sleep 5"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(1)));
    }
}
