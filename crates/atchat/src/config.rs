//! Channel configuration.
//!
//! A [`ChatConfig`] bundles the per-channel settings a modem driver would
//! otherwise apply by hand after opening the channel: framing syntax, wakeup
//! probe, custom terminators and the built-in blacklist.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::syntax::SyntaxKind;
use crate::terminator::{BuiltinTerminator, TerminatorMatch, TerminatorRule};

/// Default number of transport reads per readable event.
pub const DEFAULT_MAX_READ_ATTEMPTS: u32 = 3;

// ============================================================================
// Configuration Types
// ============================================================================

/// Configuration for one chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Channel name, used in logs and metric labels.
    pub name: String,
    /// Line framing.
    pub syntax: SyntaxKind,
    /// Probe sent before commands when the modem may be asleep.
    pub wakeup: Option<WakeupConfig>,
    /// Extra terminators, checked after the built-ins.
    pub terminators: Vec<TerminatorConfig>,
    /// Built-in terminators to ignore.
    pub blacklist: Vec<BuiltinTerminator>,
    /// Rewrite `U<4 digits>` line tags to `U0000`.
    pub strip_sequence_tags: bool,
    /// Transport reads per readable event.
    pub max_read_attempts: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            name: "modem".to_string(),
            syntax: SyntaxKind::default(),
            wakeup: None,
            terminators: Vec::new(),
            blacklist: Vec::new(),
            strip_sequence_tags: false,
            max_read_attempts: DEFAULT_MAX_READ_ATTEMPTS,
        }
    }
}

/// Wakeup probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeupConfig {
    /// Bytes written as is, including any line terminator.
    pub command: String,
    /// How long to wait for the probe's answer.
    pub response_timeout_ms: u64,
    /// Idle time after which the next command is preceded by a probe.
    pub inactivity_ms: u64,
}

impl WakeupConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_millis(self.inactivity_ms)
    }
}

/// A custom terminator rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminatorConfig {
    pub pattern: String,
    /// Compare only this many leading bytes; absent means the whole line.
    #[serde(default)]
    pub match_len: Option<usize>,
    pub success: bool,
}

impl TerminatorConfig {
    pub fn to_rule(&self) -> TerminatorRule {
        TerminatorRule::new(
            self.pattern.clone(),
            TerminatorMatch::from_len(self.match_len),
            self.success,
        )
    }
}

impl ChatConfig {
    /// Parse a YAML document and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ChatConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_read_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_read_attempts must be at least 1".to_string(),
            ));
        }

        if let Some(wakeup) = &self.wakeup {
            if wakeup.command.is_empty() {
                return Err(ConfigError::Invalid("wakeup command is empty".to_string()));
            }
            if wakeup.response_timeout_ms == 0 {
                return Err(ConfigError::Invalid(
                    "wakeup response_timeout_ms must be non-zero".to_string(),
                ));
            }
        }

        if let Some(t) = self.terminators.iter().find(|t| t.pattern.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "terminator with empty pattern (success={})",
                t.success
            )));
        }

        Ok(())
    }
}
