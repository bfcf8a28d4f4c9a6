//! Line framing for the incoming byte stream.
//!
//! A [`Syntax`] only decides where a unit of input ends (a line, a PDU, a
//! prompt). It knows nothing about commands or prefixes; the engine uses the
//! framing result together with its own state to decide what the bytes mean,
//! and steers the recognizer with a [`SyntaxHint`] when it knows what the
//! modem is about to send.

use serde::{Deserialize, Serialize};

/// Outcome of feeding bytes to a syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxResult {
    /// No complete unit yet; all fed bytes were consumed.
    NeedMore,
    /// A complete response line.
    Line,
    /// A complete line of a multiline response (raw text body).
    Multiline,
    /// A complete PDU line following a PDU header.
    Pdu,
    /// The modem's data-entry prompt (`"> "`).
    Prompt,
    /// The consumed bytes are not framed data and should be discarded.
    Unrecognized,
}

/// What the engine expects the modem to send next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyntaxHint {
    /// Ordinary line framing.
    #[default]
    None,
    /// The next line is a PDU.
    ExpectPdu,
    /// Following lines may be raw multiline text.
    ExpectMultiline,
    /// The modem answers with a short `\r\n> ` style prompt.
    ExpectShortPrompt,
}

/// An incremental framing recognizer.
pub trait Syntax {
    /// Consume bytes from the front of `bytes`.
    ///
    /// Returns how many bytes were consumed together with the framing result.
    /// When the result is anything but [`SyntaxResult::NeedMore`], the unit
    /// ends at the returned offset.
    fn feed(&mut self, bytes: &[u8]) -> (usize, SyntaxResult);

    /// Tell the recognizer what to expect next.
    fn set_hint(&mut self, hint: SyntaxHint);
}

/// Which built-in syntax a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntaxKind {
    /// Strict V.250 framing: `\r\n<line>\r\n`.
    #[default]
    Gsmv1,
    /// Lines end at `\r`; stray CR/LF between lines are ignored.
    Permissive,
}

impl SyntaxKind {
    /// Instantiate the syntax.
    pub fn build(self) -> Box<dyn Syntax> {
        match self {
            SyntaxKind::Gsmv1 => Box::new(GsmV1Syntax::new()),
            SyntaxKind::Permissive => Box::new(PermissiveSyntax::new()),
        }
    }
}

// ============================================================================
// GSM V.250 syntax
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum V1State {
    Idle,
    InitialCr,
    InitialLf,
    Response,
    ResponseString,
    TerminatorCr,
    GuessMultilineResponse,
    MultilineResponse,
    MultilineTerminatorCr,
    PduCheckExtraCr,
    PduCheckExtraLf,
    Pdu,
    PduCr,
    Prompt,
    ShortPrompt,
    ShortPromptCr,
    Garbage,
    GarbageCheckLf,
}

/// Strict GSM 07.07 / V.250 framing.
///
/// Responses are framed as `\r\n<text>\r\n`. Anything outside that framing
/// (command echo, line noise) is reported as [`SyntaxResult::Unrecognized`]
/// so the engine can discard it.
#[derive(Debug, Clone)]
pub struct GsmV1Syntax {
    state: V1State,
}

impl Default for GsmV1Syntax {
    fn default() -> Self {
        Self::new()
    }
}

impl GsmV1Syntax {
    /// Create a recognizer in the idle state.
    pub fn new() -> Self {
        GsmV1Syntax { state: V1State::Idle }
    }
}

impl Syntax for GsmV1Syntax {
    fn feed(&mut self, bytes: &[u8]) -> (usize, SyntaxResult) {
        use V1State::*;

        for (i, &byte) in bytes.iter().enumerate() {
            match self.state {
                Idle => {
                    self.state = match byte {
                        b'\r' => InitialCr,
                        b'>' => Prompt,
                        _ => Garbage,
                    };
                }
                InitialCr => match byte {
                    b'\n' => self.state = InitialLf,
                    b'\r' => {
                        self.state = Idle;
                        return (i, SyntaxResult::Unrecognized);
                    }
                    _ => self.state = Garbage,
                },
                InitialLf => {
                    self.state = match byte {
                        b'\r' => TerminatorCr,
                        b'>' => Prompt,
                        b'"' => ResponseString,
                        _ => Response,
                    };
                }
                Response => match byte {
                    b'\r' => self.state = TerminatorCr,
                    b'"' => self.state = ResponseString,
                    _ => {}
                },
                ResponseString => {
                    if byte == b'"' {
                        self.state = Response;
                    }
                }
                TerminatorCr => {
                    self.state = Idle;
                    return if byte == b'\n' {
                        (i + 1, SyntaxResult::Line)
                    } else {
                        (i, SyntaxResult::Unrecognized)
                    };
                }
                GuessMultilineResponse => {
                    self.state = if byte == b'\r' {
                        InitialCr
                    } else {
                        MultilineResponse
                    };
                }
                MultilineResponse => {
                    if byte == b'\r' {
                        self.state = MultilineTerminatorCr;
                    }
                }
                MultilineTerminatorCr => {
                    self.state = Idle;
                    return if byte == b'\n' {
                        (i + 1, SyntaxResult::Multiline)
                    } else {
                        (i, SyntaxResult::Unrecognized)
                    };
                }
                // Some modems put an extra CRLF between the header and the
                // PDU; swallow it before reading the PDU itself.
                PduCheckExtraCr => {
                    self.state = if byte == b'\r' { PduCheckExtraLf } else { Pdu };
                }
                PduCheckExtraLf => {
                    self.state = Pdu;
                    let consumed = if byte == b'\n' { i + 1 } else { i };
                    return (consumed, SyntaxResult::Unrecognized);
                }
                Pdu => {
                    if byte == b'\r' {
                        self.state = PduCr;
                    }
                }
                PduCr => {
                    self.state = Idle;
                    return if byte == b'\n' {
                        (i + 1, SyntaxResult::Pdu)
                    } else {
                        (i, SyntaxResult::Unrecognized)
                    };
                }
                Prompt => {
                    if byte == b' ' {
                        self.state = Idle;
                        return (i + 1, SyntaxResult::Prompt);
                    }
                    self.state = if byte == b'\r' { TerminatorCr } else { Response };
                }
                ShortPrompt => {
                    self.state = if byte == b'\n' { ShortPromptCr } else { Response };
                }
                ShortPromptCr => {
                    if byte == b'\r' {
                        self.state = Idle;
                        return (i + 1, SyntaxResult::Prompt);
                    }
                    self.state = Response;
                }
                Garbage => match byte {
                    b'\r' => self.state = GarbageCheckLf,
                    // Modems that skip the CRLF between echo and prompt.
                    b'>' => self.state = Prompt,
                    _ => {}
                },
                GarbageCheckLf => {
                    self.state = Idle;
                    let consumed = if byte == b'\n' { i + 1 } else { i };
                    return (consumed, SyntaxResult::Unrecognized);
                }
            }
        }

        (bytes.len(), SyntaxResult::NeedMore)
    }

    fn set_hint(&mut self, hint: SyntaxHint) {
        match hint {
            SyntaxHint::ExpectPdu => self.state = V1State::PduCheckExtraCr,
            SyntaxHint::ExpectMultiline => self.state = V1State::GuessMultilineResponse,
            SyntaxHint::ExpectShortPrompt => self.state = V1State::ShortPrompt,
            SyntaxHint::None => {}
        }
    }
}

// ============================================================================
// Permissive syntax
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissiveState {
    Idle,
    Response,
    ResponseString,
    GuessPdu,
    Pdu,
    Prompt,
    ShortPrompt,
    ShortPromptCr,
}

/// Lenient framing for modems that do not follow V.250.
///
/// A line ends at `\r`; line feeds and empty lines are skipped.
#[derive(Debug, Clone)]
pub struct PermissiveSyntax {
    state: PermissiveState,
}

impl Default for PermissiveSyntax {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissiveSyntax {
    /// Create a recognizer in the idle state.
    pub fn new() -> Self {
        PermissiveSyntax {
            state: PermissiveState::Idle,
        }
    }
}

impl Syntax for PermissiveSyntax {
    fn feed(&mut self, bytes: &[u8]) -> (usize, SyntaxResult) {
        use PermissiveState::*;

        for (i, &byte) in bytes.iter().enumerate() {
            match self.state {
                Idle => match byte {
                    b'\r' | b'\n' => {}
                    b'>' => self.state = Prompt,
                    b'"' => self.state = ResponseString,
                    _ => self.state = Response,
                },
                Response => match byte {
                    b'\r' | b'\n' => {
                        self.state = Idle;
                        return (i + 1, SyntaxResult::Line);
                    }
                    b'"' => self.state = ResponseString,
                    _ => {}
                },
                ResponseString => {
                    if byte == b'"' {
                        self.state = Response;
                    }
                }
                GuessPdu => {
                    if byte != b'\r' && byte != b'\n' {
                        self.state = Pdu;
                    }
                }
                Pdu => {
                    if byte == b'\r' || byte == b'\n' {
                        self.state = Idle;
                        return (i + 1, SyntaxResult::Pdu);
                    }
                }
                Prompt => {
                    if byte == b' ' {
                        self.state = Idle;
                        return (i + 1, SyntaxResult::Prompt);
                    }
                    if byte == b'\r' || byte == b'\n' {
                        self.state = Idle;
                        return (i + 1, SyntaxResult::Line);
                    }
                    self.state = Response;
                }
                ShortPrompt => {
                    self.state = if byte == b'\n' { ShortPromptCr } else { Response };
                }
                ShortPromptCr => {
                    if byte == b'\r' {
                        self.state = Idle;
                        return (i + 1, SyntaxResult::Prompt);
                    }
                    self.state = Response;
                }
            }
        }

        (bytes.len(), SyntaxResult::NeedMore)
    }

    fn set_hint(&mut self, hint: SyntaxHint) {
        match hint {
            SyntaxHint::ExpectPdu => self.state = PermissiveState::GuessPdu,
            SyntaxHint::ExpectShortPrompt => self.state = PermissiveState::ShortPrompt,
            SyntaxHint::ExpectMultiline | SyntaxHint::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed the whole input and collect every framed unit as (result, text).
    fn frame_all(syntax: &mut dyn Syntax, input: &[u8]) -> Vec<(SyntaxResult, String)> {
        let mut out = Vec::new();
        let mut pos = 0;
        let mut start = 0;

        while pos < input.len() {
            let (consumed, result) = syntax.feed(&input[pos..]);
            pos += consumed;
            if result != SyntaxResult::NeedMore {
                let text = String::from_utf8_lossy(&input[start..pos]).to_string();
                out.push((result, text));
                start = pos;
            }
        }

        out
    }

    #[test]
    fn test_v1_single_line() {
        let mut syntax = GsmV1Syntax::new();
        let framed = frame_all(&mut syntax, b"\r\nOK\r\n");
        assert_eq!(framed, vec![(SyntaxResult::Line, "\r\nOK\r\n".to_string())]);
    }

    #[test]
    fn test_v1_split_across_feeds() {
        let mut syntax = GsmV1Syntax::new();

        assert_eq!(syntax.feed(b"\r\n+CR"), (5, SyntaxResult::NeedMore));
        assert_eq!(syntax.feed(b"EG: 1,5\r"), (8, SyntaxResult::NeedMore));
        assert_eq!(syntax.feed(b"\n\r\nOK"), (1, SyntaxResult::Line));
    }

    #[test]
    fn test_v1_quoted_cr_does_not_end_line() {
        let mut syntax = GsmV1Syntax::new();
        let framed = frame_all(&mut syntax, b"\r\n+COPS: 0,0,\"a\rb\"\r\n");
        assert_eq!(framed.len(), 1);
        assert_eq!(framed[0].0, SyntaxResult::Line);
    }

    #[test]
    fn test_v1_echo_is_unrecognized() {
        let mut syntax = GsmV1Syntax::new();
        let framed = frame_all(&mut syntax, b"ATE0\r\r\nOK\r\n");
        assert_eq!(
            framed,
            vec![
                (SyntaxResult::Unrecognized, "ATE0\r".to_string()),
                (SyntaxResult::Line, "\r\nOK\r\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_v1_prompt() {
        let mut syntax = GsmV1Syntax::new();
        let framed = frame_all(&mut syntax, b"\r\n> ");
        assert_eq!(framed, vec![(SyntaxResult::Prompt, "\r\n> ".to_string())]);
    }

    #[test]
    fn test_v1_pdu_hint_tolerates_extra_crlf() {
        let mut syntax = GsmV1Syntax::new();
        syntax.set_hint(SyntaxHint::ExpectPdu);
        let framed = frame_all(&mut syntax, b"\r\n0791AB\r\n");
        assert_eq!(
            framed,
            vec![
                (SyntaxResult::Unrecognized, "\r\n".to_string()),
                (SyntaxResult::Pdu, "0791AB\r\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_v1_multiline_hint() {
        let mut syntax = GsmV1Syntax::new();
        syntax.set_hint(SyntaxHint::ExpectMultiline);
        let framed = frame_all(&mut syntax, b"hello world\r\n\r\nOK\r\n");
        assert_eq!(
            framed,
            vec![
                (SyntaxResult::Multiline, "hello world\r\n".to_string()),
                (SyntaxResult::Line, "\r\nOK\r\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_v1_short_prompt() {
        let mut syntax = GsmV1Syntax::new();
        syntax.set_hint(SyntaxHint::ExpectShortPrompt);
        assert_eq!(syntax.feed(b"\n\r"), (2, SyntaxResult::Prompt));
    }

    #[test]
    fn test_permissive_lines() {
        let mut syntax = PermissiveSyntax::new();
        let framed = frame_all(&mut syntax, b"\r\n+CREG: 1\r\nOK\r");
        let results: Vec<_> = framed.iter().map(|(r, _)| *r).collect();
        assert_eq!(results, vec![SyntaxResult::Line, SyntaxResult::Line]);
    }

    #[test]
    fn test_permissive_pdu_hint() {
        let mut syntax = PermissiveSyntax::new();
        syntax.set_hint(SyntaxHint::ExpectPdu);
        let framed = frame_all(&mut syntax, b"\n0011\r");
        assert_eq!(framed, vec![(SyntaxResult::Pdu, "\n0011\r".to_string())]);
    }

    #[test]
    fn test_permissive_prompt() {
        let mut syntax = PermissiveSyntax::new();
        let framed = frame_all(&mut syntax, b"> ");
        assert_eq!(framed, vec![(SyntaxResult::Prompt, "> ".to_string())]);
    }
}
