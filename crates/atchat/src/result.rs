//! Response view handed to callbacks, and a field cursor over it.
//!
//! An [`AtResult`] carries the response lines of a command (or the single line
//! of a notification) plus either the final result line or a PDU payload.
//! [`ResultIter`] walks those lines the way drivers usually parse 27.007
//! responses: select a line by prefix, then read comma separated fields.

/// Lines delivered to a completion, listing or notification callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtResult {
    lines: Vec<String>,
    final_or_pdu: Option<String>,
}

impl AtResult {
    pub fn new(lines: Vec<String>, final_or_pdu: Option<String>) -> Self {
        AtResult {
            lines,
            final_or_pdu,
        }
    }

    /// A result holding exactly one line.
    pub fn single(line: impl Into<String>) -> Self {
        AtResult::new(vec![line.into()], None)
    }

    /// Response lines in the order they were received.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The terminator line for a completion, or the PDU for a PDU result.
    pub fn final_or_pdu(&self) -> Option<&str> {
        self.final_or_pdu.as_deref()
    }

    /// Cursor over the lines.
    pub fn iter(&self) -> ResultIter<'_> {
        ResultIter::new(self)
    }
}

/// Field cursor over an [`AtResult`].
///
/// All `next_*` readers return `None` without moving the cursor when the
/// field at the cursor does not have the requested shape.
#[derive(Debug, Clone)]
pub struct ResultIter<'a> {
    result: &'a AtResult,
    next_line: usize,
    line: Option<&'a str>,
    pos: usize,
}

impl<'a> ResultIter<'a> {
    pub fn new(result: &'a AtResult) -> Self {
        ResultIter {
            result,
            next_line: 0,
            line: None,
            pos: 0,
        }
    }

    /// Advance to the next line starting with `prefix` and position the
    /// cursor after the prefix and any following spaces. An empty prefix
    /// accepts the next line as is.
    pub fn next(&mut self, prefix: &str) -> bool {
        while let Some(line) = self.result.lines.get(self.next_line) {
            self.next_line += 1;

            if line.starts_with(prefix) {
                self.line = Some(line.as_str());
                self.pos = if prefix.is_empty() {
                    0
                } else {
                    skip_spaces(line.as_bytes(), prefix.len())
                };
                return true;
            }
        }

        self.line = None;
        self.pos = 0;
        false
    }

    /// The unparsed remainder of the current line.
    pub fn raw_line(&self) -> Option<&'a str> {
        self.line.map(|line| &line[self.pos..])
    }

    /// The PDU or final line carried by the result.
    pub fn pdu(&self) -> Option<&'a str> {
        self.result.final_or_pdu()
    }

    /// Read a decimal number.
    pub fn next_number(&mut self) -> Option<i64> {
        let line = self.line?.as_bytes();
        let mut end = self.pos;
        let mut value: i64 = 0;

        while end < line.len() && line[end].is_ascii_digit() {
            value = value
                .checked_mul(10)?
                .checked_add(i64::from(line[end] - b'0'))?;
            end += 1;
        }

        if end == self.pos {
            return None;
        }

        self.pos = skip_to_next_field(line, end);
        Some(value)
    }

    /// Read a decimal number, or `default` if the field is empty.
    pub fn next_number_default(&mut self, default: i64) -> Option<i64> {
        let line = self.line?.as_bytes();

        if self.pos >= line.len() || line[self.pos] == b',' {
            self.pos = skip_to_next_field(line, self.pos);
            return Some(default);
        }

        self.next_number()
    }

    /// Read a quoted string. An omitted field reads as the empty string.
    pub fn next_string(&mut self) -> Option<&'a str> {
        let text = self.line?;
        let line = text.as_bytes();

        if self.pos < line.len() && line[self.pos] == b',' {
            self.pos = skip_to_next_field(line, self.pos);
            return Some("");
        }

        if self.pos >= line.len() || line[self.pos] != b'"' {
            return None;
        }

        let start = self.pos + 1;
        let close = line[start..].iter().position(|&b| b == b'"')? + start;

        self.pos = skip_to_next_field(line, close + 1);
        Some(&text[start..close])
    }

    /// Read an unquoted token, up to the next `,` or `)`.
    pub fn next_unquoted_string(&mut self) -> Option<&'a str> {
        let text = self.line?;
        let line = text.as_bytes();

        if self.pos < line.len() && line[self.pos] == b'"' {
            return None;
        }

        let start = self.pos;
        let end = line[start..]
            .iter()
            .position(|&b| b == b',' || b == b')')
            .map_or(line.len(), |n| n + start);

        self.pos = skip_to_next_field(line, end);
        Some(&text[start..end])
    }

    /// Read a hex encoded field, optionally quoted, and decode it.
    pub fn next_hexstring(&mut self) -> Option<Vec<u8>> {
        let text = self.line?;
        let line = text.as_bytes();
        let quoted = self.pos < line.len() && line[self.pos] == b'"';
        let start = if quoted { self.pos + 1 } else { self.pos };

        let end = line[start..]
            .iter()
            .position(|b| !b.is_ascii_hexdigit())
            .map_or(line.len(), |n| n + start);

        let mut after = end;
        if quoted {
            if after >= line.len() || line[after] != b'"' {
                return None;
            }
            after += 1;
        }

        let bytes = hex::decode(&text[start..end]).ok()?;
        self.pos = skip_to_next_field(line, after);
        Some(bytes)
    }

    /// Skip one field of any shape, including a parenthesized list.
    pub fn skip_next(&mut self) -> bool {
        let Some(text) = self.line else {
            return false;
        };
        let line = text.as_bytes();
        let mut end = self.pos;

        if end >= line.len() {
            return false;
        }

        match line[end] {
            b'"' => {
                end += 1;
                while end < line.len() && line[end] != b'"' {
                    end += 1;
                }
                if end >= line.len() {
                    return false;
                }
                end += 1;
            }
            b'(' => {
                let mut depth = 0;
                while end < line.len() {
                    match line[end] {
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    end += 1;
                }
                if end >= line.len() {
                    return false;
                }
                end += 1;
            }
            _ => {
                while end < line.len() && line[end] != b',' && line[end] != b')' {
                    end += 1;
                }
            }
        }

        self.pos = skip_to_next_field(line, end);
        true
    }

    /// Enter a parenthesized list.
    pub fn open_list(&mut self) -> bool {
        let Some(line) = self.line.map(str::as_bytes) else {
            return false;
        };

        if self.pos < line.len() && line[self.pos] == b'(' {
            self.pos = skip_spaces(line, self.pos + 1);
            return true;
        }

        false
    }

    /// Leave a parenthesized list.
    pub fn close_list(&mut self) -> bool {
        let Some(line) = self.line.map(str::as_bytes) else {
            return false;
        };

        if self.pos < line.len() && line[self.pos] == b')' {
            self.pos = skip_to_next_field(line, self.pos + 1);
            return true;
        }

        false
    }
}

fn skip_spaces(line: &[u8], mut pos: usize) -> usize {
    while pos < line.len() && line[pos] == b' ' {
        pos += 1;
    }
    pos
}

fn skip_to_next_field(line: &[u8], mut pos: usize) -> usize {
    if pos < line.len() && line[pos] == b',' {
        pos += 1;
    }
    skip_spaces(line, pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creg_fields() {
        let result = AtResult::new(vec!["+CREG: 2,1,\"00C3\",\"0000130F\",2".into()], Some("OK".into()));
        let mut iter = result.iter();

        assert!(iter.next("+CREG:"));
        assert_eq!(iter.next_number(), Some(2));
        assert_eq!(iter.next_number(), Some(1));
        assert_eq!(iter.next_string(), Some("00C3"));
        assert_eq!(iter.next_hexstring(), Some(vec![0x00, 0x00, 0x13, 0x0F]));
        assert_eq!(iter.next_number(), Some(2));
        assert_eq!(iter.next_number(), None);
    }

    #[test]
    fn test_next_skips_other_prefixes() {
        let result = AtResult::new(
            vec!["+CLCC: 1,0".into(), "+COLP: x".into(), "+CLCC: 2,1".into()],
            None,
        );
        let mut iter = result.iter();

        assert!(iter.next("+CLCC:"));
        assert_eq!(iter.next_number(), Some(1));
        assert!(iter.next("+CLCC:"));
        assert_eq!(iter.next_number(), Some(2));
        assert!(!iter.next("+CLCC:"));
        assert!(iter.raw_line().is_none());
    }

    #[test]
    fn test_empty_prefix_takes_any_line() {
        let result = AtResult::single("0791448720003023");
        let mut iter = result.iter();

        assert!(iter.next(""));
        assert_eq!(iter.raw_line(), Some("0791448720003023"));
    }

    #[test]
    fn test_defaults_and_omitted_fields() {
        let result = AtResult::single("+CMGL: 1,,\"x\"");
        let mut iter = result.iter();

        assert!(iter.next("+CMGL:"));
        assert_eq!(iter.next_number(), Some(1));
        assert_eq!(iter.next_number_default(7), Some(7));
        assert_eq!(iter.next_string(), Some("x"));
    }

    #[test]
    fn test_lists_and_skip() {
        let result = AtResult::single("+COPS: (2,\"Op\",\"O\",\"24405\"),(1,\"B\"),,(0-4)");
        let mut iter = result.iter();

        assert!(iter.next("+COPS:"));
        assert!(iter.open_list());
        assert_eq!(iter.next_number(), Some(2));
        assert_eq!(iter.next_string(), Some("Op"));
        assert!(iter.skip_next());
        assert_eq!(iter.next_unquoted_string(), None);
        assert_eq!(iter.next_string(), Some("24405"));
        assert!(iter.close_list());
        assert!(iter.skip_next());
        assert_eq!(iter.raw_line(), Some(",(0-4)"));
    }

    #[test]
    fn test_unquoted_string_stops_at_separator() {
        let result = AtResult::single("~+CREG=1,AB12)");
        let mut iter = result.iter();

        assert!(iter.next("~+CREG="));
        assert_eq!(iter.next_unquoted_string(), Some("1"));
        assert_eq!(iter.next_unquoted_string(), Some("AB12"));
    }

    #[test]
    fn test_pdu_accessor() {
        let result = AtResult::new(vec!["+CMT: ,23".into()], Some("0011AABB".into()));
        let iter = result.iter();

        assert_eq!(iter.pdu(), Some("0011AABB"));
        assert_eq!(result.lines(), &["+CMT: ,23".to_string()]);
    }
}
