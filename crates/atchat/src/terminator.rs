//! Final-response ("terminator") recognition.
//!
//! A terminator line ends the response to the command at the head of the
//! queue and decides whether it succeeded. The built-in table covers the
//! standard V.250 / 27.007 result codes; channels can disable individual
//! entries and add their own rules.

use serde::{Deserialize, Serialize};

/// Built-in terminators, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinTerminator {
    Ok,
    Error,
    NoDialtone,
    Busy,
    NoCarrier,
    Connect,
    NoAnswer,
    CmsError,
    CmeError,
    ExtError,
}

impl BuiltinTerminator {
    /// Every built-in, in table order.
    pub const ALL: [BuiltinTerminator; 10] = [
        BuiltinTerminator::Ok,
        BuiltinTerminator::Error,
        BuiltinTerminator::NoDialtone,
        BuiltinTerminator::Busy,
        BuiltinTerminator::NoCarrier,
        BuiltinTerminator::Connect,
        BuiltinTerminator::NoAnswer,
        BuiltinTerminator::CmsError,
        BuiltinTerminator::CmeError,
        BuiltinTerminator::ExtError,
    ];

    /// Pattern, match mode and success flag of this built-in.
    pub const fn entry(self) -> (&'static str, TerminatorMatch, bool) {
        use BuiltinTerminator::*;
        use TerminatorMatch::{Exact, Prefix};

        match self {
            Ok => ("OK", Exact, true),
            Error => ("ERROR", Exact, false),
            NoDialtone => ("NO DIALTONE", Exact, false),
            Busy => ("BUSY", Exact, false),
            NoCarrier => ("NO CARRIER", Exact, false),
            Connect => ("CONNECT", Prefix(7), true),
            NoAnswer => ("NO ANSWER", Exact, false),
            CmsError => ("+CMS ERROR:", Prefix(11), false),
            CmeError => ("+CME ERROR:", Prefix(11), false),
            ExtError => ("+EXT ERROR:", Prefix(11), false),
        }
    }

    /// The rule this built-in stands for, as an owned value.
    pub fn rule(self) -> TerminatorRule {
        let (pattern, matching, success) = self.entry();
        TerminatorRule::new(pattern, matching, success)
    }

    fn matches(self, line: &str) -> bool {
        let (pattern, matching, _) = self.entry();
        matching.matches(pattern, line)
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// How a rule's pattern is compared against a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatorMatch {
    /// The whole line must equal the pattern.
    Exact,
    /// The first `n` bytes of the line must equal the first `n` bytes of the
    /// pattern. If `n` exceeds the pattern length the line must equal the
    /// pattern exactly, so `("+GCMS=305", Prefix(10))` does not match
    /// `"+GCMS=3051"`.
    Prefix(usize),
}

impl TerminatorMatch {
    /// Translate the conventional length argument: `None` means exact.
    pub fn from_len(len: Option<usize>) -> Self {
        match len {
            Some(n) if n > 0 => TerminatorMatch::Prefix(n),
            _ => TerminatorMatch::Exact,
        }
    }

    fn matches(self, pattern: &str, line: &str) -> bool {
        let line = line.as_bytes();
        let pattern = pattern.as_bytes();

        match self {
            TerminatorMatch::Exact => line == pattern,
            TerminatorMatch::Prefix(n) if n > pattern.len() => line == pattern,
            TerminatorMatch::Prefix(n) => line.len() >= n && line[..n] == pattern[..n],
        }
    }
}

/// A single terminator rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatorRule {
    pub pattern: String,
    pub matching: TerminatorMatch,
    pub success: bool,
}

impl TerminatorRule {
    pub fn new(pattern: impl Into<String>, matching: TerminatorMatch, success: bool) -> Self {
        TerminatorRule {
            pattern: pattern.into(),
            matching,
            success,
        }
    }

    /// Whether `line` is a terminator under this rule.
    pub fn matches(&self, line: &str) -> bool {
        self.matching.matches(&self.pattern, line)
    }
}

/// Built-in table, blacklist and custom rules of one channel.
#[derive(Debug, Clone, Default)]
pub struct TerminatorSet {
    blacklist: u16,
    custom: Vec<TerminatorRule>,
}

impl TerminatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom rule. Custom rules are consulted after the built-ins,
    /// the most recently added first.
    pub fn add(&mut self, rule: TerminatorRule) {
        self.custom.push(rule);
    }

    /// Stop recognizing a built-in terminator.
    pub fn blacklist(&mut self, terminator: BuiltinTerminator) {
        self.blacklist |= terminator.bit();
    }

    pub fn is_blacklisted(&self, terminator: BuiltinTerminator) -> bool {
        self.blacklist & terminator.bit() != 0
    }

    /// Number of custom rules.
    pub fn custom_len(&self) -> usize {
        self.custom.len()
    }

    /// Classify a line: `Some(success)` if it terminates the current command.
    pub fn classify(&self, line: &str) -> Option<bool> {
        let builtin = BuiltinTerminator::ALL
            .iter()
            .find(|t| !self.is_blacklisted(**t) && t.matches(line));

        if let Some(terminator) = builtin {
            return Some(terminator.entry().2);
        }

        self.custom
            .iter()
            .rev()
            .find(|rule| rule.matches(line))
            .map(|rule| rule.success)
    }

    /// Forget custom rules and the blacklist.
    pub fn clear(&mut self) {
        self.blacklist = 0;
        self.custom.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_results() {
        let set = TerminatorSet::new();

        assert_eq!(set.classify("OK"), Some(true));
        assert_eq!(set.classify("ERROR"), Some(false));
        assert_eq!(set.classify("NO CARRIER"), Some(false));
        assert_eq!(set.classify("CONNECT 9600"), Some(true));
        assert_eq!(set.classify("+CME ERROR: 10"), Some(false));
        assert_eq!(set.classify("+CMS ERROR: 500"), Some(false));
        assert_eq!(set.classify("+CREG: 1,5"), None);
    }

    #[test]
    fn test_builtin_entries_agree_with_rules() {
        for terminator in BuiltinTerminator::ALL {
            let (pattern, _, success) = terminator.entry();
            let rule = terminator.rule();

            assert!(terminator.matches(pattern));
            assert!(rule.matches(pattern));
            assert_eq!(rule.success, success);
            assert_eq!(TerminatorSet::new().classify(pattern), Some(success));
        }
    }

    #[test]
    fn test_exact_rules_reject_longer_lines() {
        let set = TerminatorSet::new();

        assert_eq!(set.classify("OKAY"), None);
        assert_eq!(set.classify("ERROR="), None);
    }

    #[test]
    fn test_prefix_longer_than_pattern_is_exact() {
        let rule = TerminatorRule::new("+GCMS=305", TerminatorMatch::Prefix(10), true);

        assert!(rule.matches("+GCMS=305"));
        assert!(!rule.matches("+GCMS=3051"));
        assert!(!rule.matches("+GCMS=30"));
    }

    #[test]
    fn test_short_prefix() {
        let rule = TerminatorRule::new("ERROR=", TerminatorMatch::Prefix(6), false);

        assert!(rule.matches("ERROR=4"));
        assert!(!rule.matches("ERROR"));
    }

    #[test]
    fn test_builtin_wins_over_custom() {
        let mut set = TerminatorSet::new();
        set.add(TerminatorRule::new("OK", TerminatorMatch::Exact, false));

        assert_eq!(set.classify("OK"), Some(true));
    }

    #[test]
    fn test_blacklisted_builtin_falls_through_to_custom() {
        let mut set = TerminatorSet::new();
        set.blacklist(BuiltinTerminator::Ok);
        set.add(TerminatorRule::new("OK", TerminatorMatch::Exact, false));

        assert!(set.is_blacklisted(BuiltinTerminator::Ok));
        assert_eq!(set.classify("OK"), Some(false));
    }

    #[test]
    fn test_blacklisted_without_custom_is_not_terminator() {
        let mut set = TerminatorSet::new();
        set.blacklist(BuiltinTerminator::Error);

        assert_eq!(set.classify("ERROR"), None);
        assert_eq!(set.classify("OK"), Some(true));
    }

    #[test]
    fn test_newest_custom_rule_first() {
        let mut set = TerminatorSet::new();
        set.add(TerminatorRule::new("+GCNMA=", TerminatorMatch::Prefix(7), false));
        set.add(TerminatorRule::new("+GCNMA=OK", TerminatorMatch::Prefix(9), true));

        assert_eq!(set.classify("+GCNMA=OK"), Some(true));
        assert_eq!(set.classify("+GCNMA=305"), Some(false));
        assert_eq!(set.custom_len(), 2);
    }

    #[test]
    fn test_from_len() {
        assert_eq!(TerminatorMatch::from_len(None), TerminatorMatch::Exact);
        assert_eq!(TerminatorMatch::from_len(Some(0)), TerminatorMatch::Exact);
        assert_eq!(TerminatorMatch::from_len(Some(6)), TerminatorMatch::Prefix(6));
    }
}
