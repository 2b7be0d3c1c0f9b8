//! Where the upgrade tool runs: on this machine, or on a jump host reached
//! over `ssh`.

use std::process::Command;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ToolHostKind {
    Local,
    Ssh,
}

impl ToolHostKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ToolHostError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub trait ToolHost: Send + Sync {
    fn kind(&self) -> ToolHostKind;

    /// Builds (but does not spawn) the command running `argv` on this host.
    fn command(&self, argv: &[String]) -> Result<Command, ToolHostError>;

    /// Strips host details that must not reach task logs.
    fn redact(&self, text: &str) -> String {
        text.to_string()
    }
}

#[derive(Clone, Debug, Default)]
pub struct LocalToolHost;

impl ToolHost for LocalToolHost {
    fn kind(&self) -> ToolHostKind {
        ToolHostKind::Local
    }

    fn command(&self, argv: &[String]) -> Result<Command, ToolHostError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ToolHostError::InvalidInput("argv-empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

#[derive(Clone, Debug)]
pub struct SshToolHost {
    target: String,
    default_opts: Vec<String>,
}

impl SshToolHost {
    pub fn new(target: String) -> Result<Self, ToolHostError> {
        validate_ssh_target(&target).map_err(ToolHostError::InvalidInput)?;
        Ok(Self {
            target: target.trim().to_string(),
            default_opts: vec![
                "-oBatchMode=yes".to_string(),
                "-oStrictHostKeyChecking=accept-new".to_string(),
                "-oConnectTimeout=10".to_string(),
                "-oConnectionAttempts=1".to_string(),
                "-oServerAliveInterval=30".to_string(),
            ],
        })
    }

    pub fn ssh_argv(&self, remote_argv: &[String]) -> Result<Vec<String>, ToolHostError> {
        validate_remote_argv(remote_argv)?;
        let mut argv = Vec::with_capacity(self.default_opts.len() + remote_argv.len() + 1);
        argv.extend(self.default_opts.iter().cloned());
        argv.push(self.target.clone());
        argv.extend(remote_argv.iter().cloned());
        Ok(argv)
    }
}

impl ToolHost for SshToolHost {
    fn kind(&self) -> ToolHostKind {
        ToolHostKind::Ssh
    }

    fn command(&self, argv: &[String]) -> Result<Command, ToolHostError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_argv(argv)?);
        Ok(cmd)
    }

    fn redact(&self, text: &str) -> String {
        if ssh_target_hint(&self.target) == "<redacted>" {
            text.replace(&self.target, "<redacted>")
        } else {
            text.to_string()
        }
    }
}

pub fn validate_ssh_target(raw: &str) -> Result<(), String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("ssh-target-empty".to_string());
    }
    if trimmed.len() > 512 {
        return Err("ssh-target-too-long".to_string());
    }
    // `ssh <opts> -oProxyCommand=...` would be read as another option.
    if trimmed.starts_with('-') {
        return Err("ssh-target-invalid-leading-dash".to_string());
    }
    if trimmed.chars().any(is_disallowed_shell_char) {
        return Err("ssh-target-unsafe-char".to_string());
    }
    Ok(())
}

/// ssh joins the remote argv into one shell command line, so every token must
/// be free of shell metacharacters.
fn validate_remote_argv(remote_argv: &[String]) -> Result<(), ToolHostError> {
    if remote_argv.is_empty() {
        return Err(ToolHostError::InvalidInput("remote-argv-empty".to_string()));
    }
    if remote_argv[0].starts_with('-') {
        return Err(ToolHostError::InvalidInput(
            "remote-command-leading-dash".to_string(),
        ));
    }
    for token in remote_argv {
        if token.trim().is_empty() {
            return Err(ToolHostError::InvalidInput("token-empty".to_string()));
        }
        if token.chars().any(is_disallowed_shell_char) {
            return Err(ToolHostError::InvalidInput(format!(
                "token-unsafe-char: {token}"
            )));
        }
    }
    Ok(())
}

fn is_disallowed_shell_char(ch: char) -> bool {
    ch.is_whitespace()
        || matches!(
            ch,
            ';' | '|' | '&' | '$' | '(' | ')' | '`' | '"' | '\'' | '<' | '>' | '\\' | '*' | '?'
        )
}

pub fn ssh_target_hint(target: &str) -> String {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    // Plain ssh config aliases are safe to show; anything else may carry a
    // username or an address.
    let looks_like_alias = trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'));
    if looks_like_alias {
        trimmed.to_string()
    } else {
        "<redacted>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ssh_command_includes_required_options() {
        let host = SshToolHost::new("upgrade-jump".to_string()).unwrap();
        let built = host
            .ssh_argv(&argv(&["ssh_cli", "--ne-ip", "200.200.18.101"]))
            .unwrap();

        assert!(built.iter().any(|a| a == "-oBatchMode=yes"));
        assert!(built.iter().any(|a| a == "-oStrictHostKeyChecking=accept-new"));
        let target_pos = built.iter().position(|a| a == "upgrade-jump").unwrap();
        assert_eq!(built[target_pos + 1], "ssh_cli");
        assert_eq!(built.last().unwrap(), "200.200.18.101");
    }

    #[test]
    fn remote_argv_rejects_shell_metacharacters() {
        let host = SshToolHost::new("upgrade-jump".to_string()).unwrap();
        assert!(host.ssh_argv(&argv(&["ssh_cli", "/builds/v1;rm -rf /"])).is_err());
        assert!(host.ssh_argv(&argv(&["ssh_cli", "$(id)"])).is_err());
        assert!(host.ssh_argv(&argv(&["-oProxyCommand=sh"])).is_err());
        assert!(host.ssh_argv(&[]).is_err());
    }

    #[test]
    fn validate_ssh_target_rejects_unsafe() {
        assert!(validate_ssh_target("upgrade-jump").is_ok());
        assert!(validate_ssh_target("ops@192.168.31.15").is_ok());
        assert!(validate_ssh_target("ssh://ops@192.168.31.15:2222").is_ok());
        assert!(validate_ssh_target("-oProxyCommand=sh").is_err());
        assert!(validate_ssh_target("bad target").is_err());
        assert!(validate_ssh_target("").is_err());
    }

    #[test]
    fn redacts_non_alias_targets() {
        let host = SshToolHost::new("ops@10.1.2.3".to_string()).unwrap();
        assert_eq!(
            host.redact("ssh: connect to ops@10.1.2.3 refused"),
            "ssh: connect to <redacted> refused"
        );

        let alias = SshToolHost::new("upgrade-jump".to_string()).unwrap();
        assert_eq!(alias.redact("upgrade-jump down"), "upgrade-jump down");
        assert_eq!(ssh_target_hint(""), "<empty>");
    }

    #[test]
    fn local_host_runs_argv_directly() {
        let host = LocalToolHost;
        let cmd = host.command(&argv(&["ssh_cli", "upgrade"])).unwrap();
        assert_eq!(cmd.get_program(), "ssh_cli");
        assert_eq!(cmd.get_args().count(), 1);
        assert!(host.command(&[]).is_err());
        assert_eq!(host.kind().as_str(), "local");
    }
}
