//! Chat scripts: what to configure, listen for and send on a channel.

use std::path::Path;
use std::time::Duration;

use atchat::{ChatConfig, CommandRequest};
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

// ============================================================================
// Script Types
// ============================================================================

/// A session description loaded from YAML.
///
/// ```yaml
/// chat:
///   name: modem0
///   wakeup: { command: "AT\r", response_timeout_ms: 1000, inactivity_ms: 5000 }
/// notifications:
///   - prefix: "+CREG:"
///   - prefix: "+CMT:"
///     pdu: true
/// commands:
///   - command: "AT+CREG?"
///     prefixes: ["+CREG:"]
/// listen_secs: 30
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatScript {
    /// Channel configuration.
    pub chat: ChatConfig,
    /// Unsolicited prefixes to report.
    pub notifications: Vec<NotificationSpec>,
    /// Commands sent in order.
    pub commands: Vec<CommandSpec>,
    /// How long to keep listening after the last command completes.
    pub listen_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub prefix: String,
    #[serde(default)]
    pub pdu: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    /// Response prefixes; absent collects every line.
    #[serde(default)]
    pub prefixes: Option<Vec<String>>,
    /// Fail the command if unanswered for this long.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        CommandSpec {
            command: command.into(),
            prefixes: None,
            timeout_ms: None,
        }
    }

    /// Build the engine request. Callbacks are attached by the caller.
    pub fn to_request(&self) -> CommandRequest {
        let mut request = CommandRequest::new(self.command.as_str());
        if let Some(prefixes) = &self.prefixes {
            request = request.prefixes(prefixes.iter().cloned());
        }
        if let Some(ms) = self.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }
        request
    }
}

impl ChatScript {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RunnerError> {
        let script: ChatScript = serde_yaml::from_str(yaml)?;
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        self.chat.validate()?;

        if let Some(spec) = self.commands.iter().find(|c| c.command.is_empty()) {
            return Err(RunnerError::InvalidScript(format!(
                "empty command (prefixes {:?})",
                spec.prefixes
            )));
        }
        if self.notifications.iter().any(|n| n.prefix.is_empty()) {
            return Err(RunnerError::InvalidScript(
                "notification with empty prefix".to_string(),
            ));
        }

        Ok(())
    }

    pub fn listen(&self) -> Duration {
        Duration::from_secs(self.listen_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atchat::SyntaxKind;

    #[test]
    fn test_parse_script() {
        let yaml = r#"
chat:
  name: modem0
  syntax: permissive
notifications:
  - prefix: "+CREG:"
  - prefix: "+CMT:"
    pdu: true
commands:
  - command: "AT+CREG?"
    prefixes: ["+CREG:"]
  - command: "AT+COPS=0"
    timeout_ms: 180000
listen_secs: 5
"#;
        let script = ChatScript::from_yaml_str(yaml).unwrap();

        assert_eq!(script.chat.name, "modem0");
        assert_eq!(script.chat.syntax, SyntaxKind::Permissive);
        assert_eq!(script.notifications.len(), 2);
        assert!(script.notifications[1].pdu);
        assert_eq!(
            script.commands[0].prefixes,
            Some(vec!["+CREG:".to_string()])
        );
        assert_eq!(script.commands[1].timeout_ms, Some(180_000));
        assert_eq!(script.listen(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_script_uses_defaults() {
        let script = ChatScript::from_yaml_str("{}").unwrap();
        assert_eq!(script, ChatScript::default());
        assert_eq!(script.chat.name, "modem");
    }

    #[test]
    fn test_rejects_empty_command() {
        let err = ChatScript::from_yaml_str("commands: [{command: \"\"}]").unwrap_err();
        assert!(matches!(err, RunnerError::InvalidScript(_)));

        let err = ChatScript::from_yaml_str("chat: {max_read_attempts: 0}").unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_command_request() {
        let spec = CommandSpec {
            command: "AT+CSQ".to_string(),
            prefixes: Some(vec!["+CSQ:".to_string()]),
            timeout_ms: Some(500),
        };
        assert_eq!(spec.to_request().command(), "AT+CSQ");
        assert_eq!(CommandSpec::new("ATI").to_request().command(), "ATI");
    }
}
