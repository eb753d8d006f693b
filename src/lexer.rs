//! Splitting of protocol lines into tokens.
//!
//! The device speaks a loose, human oriented grammar. Tokens are separated by blanks, but a
//! token may also be a `"quoted string"` or a `(bracketed)`/`[bracketed]` group in which
//! case the delimiters are not part of the token text and blanks inside are preserved.

use std::borrow::Cow;

/// A single forward pass over a line.
///
/// Every call to [`Cursor::next_token`] consumes the returned token, so tokens never overlap
/// and never extend past the end of the line.
#[derive(Clone, Debug)]
pub struct Cursor<'a> {
    line: &'a str,
    position: usize,
}

pub(crate) const fn is_blank(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t')
}

impl<'a> Cursor<'a> {
    pub fn new(line: &'a str) -> Self {
        Self { line, position: 0 }
    }

    /// Extract the next token.
    ///
    /// Returns `None` without moving the cursor once only blanks remain.
    pub fn next_token(&mut self) -> Option<&'a str> {
        let bytes = self.line.as_bytes();
        let mut start = self.position;
        while start < bytes.len() && is_blank(bytes[start]) {
            start += 1;
        }
        if start >= bytes.len() {
            return None;
        }
        let (token, next) = match bytes[start] {
            b'"' => {
                let begin = start + 1;
                let mut index = begin;
                while index < bytes.len() {
                    match bytes[index] {
                        b'\\' => index += 2,
                        b'"' => break,
                        _ => index += 1,
                    }
                }
                let end = index.min(bytes.len());
                (&self.line[begin..end], (end + 1).min(bytes.len()))
            }
            open @ (b'(' | b'[') => {
                let close = if open == b'(' { b')' } else { b']' };
                let begin = start + 1;
                let mut depth = 0usize;
                let mut index = begin;
                while index < bytes.len() {
                    let byte = bytes[index];
                    if byte == open {
                        depth += 1;
                    } else if byte == close {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    index += 1;
                }
                (&self.line[begin..index], (index + 1).min(bytes.len()))
            }
            _ => {
                let mut end = start;
                while end < bytes.len() && !is_blank(bytes[end]) {
                    end += 1;
                }
                (&self.line[start..end], end)
            }
        };
        self.position = next;
        Some(token)
    }

    /// Like [`Cursor::next_token`], but a quoted token comes back with its backslash escapes
    /// resolved, i.e. as the text that was quoted.
    pub fn next_text(&mut self) -> Option<Cow<'a, str>> {
        let quoted = self.rest().starts_with('"');
        let token = self.next_token()?;
        if !quoted || !token.contains('\\') {
            return Some(Cow::Borrowed(token));
        }
        let mut text = String::with_capacity(token.len());
        let mut chars = token.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => text.extend(chars.next()),
                c => text.push(c),
            }
        }
        Some(Cow::Owned(text))
    }

    /// The unconsumed part of the line, with leading blanks removed.
    pub fn rest(&self) -> &'a str {
        self.line[self.position..].trim_start_matches([' ', '\t'])
    }

    /// Whether only blanks (or nothing at all) remain on the line.
    pub fn is_exhausted(&self) -> bool {
        self.rest().trim_end_matches(['\r', '\n', ' ', '\t']).is_empty()
    }
}

/// Iterate over all tokens of a line.
pub fn tokens(line: &str) -> impl Iterator<Item = &str> {
    let mut cursor = Cursor::new(line);
    std::iter::from_fn(move || cursor.next_token())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_blanks() {
        let all: Vec<_> = tokens("  reg\t7   12.5 ").collect();
        assert_eq!(all, ["reg", "7", "12.5"]);
    }

    #[test]
    fn quoted_token_keeps_inner_blanks() {
        let mut cursor = Cursor::new(r#"path "a b \"c\"" tail"#);
        assert_eq!(cursor.next_token(), Some("path"));
        assert_eq!(cursor.next_token(), Some(r#"a b \"c\""#));
        assert_eq!(cursor.next_token(), Some("tail"));
        assert_eq!(cursor.next_token(), None);
    }

    #[test]
    fn quoted_text_is_unescaped() {
        let mut cursor = Cursor::new(r#"a\b "say \"hi\" \\ ok" "plain""#);
        assert_eq!(cursor.next_text().as_deref(), Some(r"a\b"));
        assert_eq!(cursor.next_text().as_deref(), Some(r#"say "hi" \ ok"#));
        assert!(matches!(cursor.next_text(), Some(Cow::Borrowed("plain"))));
        assert_eq!(cursor.next_text(), None);
    }

    #[test]
    fn brackets_are_excluded() {
        let all: Vec<_> = tokens("1 [7] pm.const_Zp = 5 (PM_NOP THREE)").collect();
        assert_eq!(all, ["1", "7", "pm.const_Zp", "=", "5", "PM_NOP THREE"]);
    }

    #[test]
    fn nested_brackets_match() {
        let all: Vec<_> = tokens("(a (b) c) d").collect();
        assert_eq!(all, ["a (b) c", "d"]);
    }

    #[test]
    fn unterminated_group_runs_to_end() {
        let mut cursor = Cursor::new("x \"abc");
        assert_eq!(cursor.next_token(), Some("x"));
        assert_eq!(cursor.next_token(), Some("abc"));
        assert!(cursor.is_exhausted());
        let mut cursor = Cursor::new("[12");
        assert_eq!(cursor.next_token(), Some("12"));
        assert_eq!(cursor.next_token(), None);
    }

    #[test]
    fn end_of_line_leaves_cursor_in_place() {
        let mut cursor = Cursor::new("one   ");
        assert_eq!(cursor.next_token(), Some("one"));
        let before = cursor.clone().rest();
        assert_eq!(cursor.next_token(), None);
        assert_eq!(cursor.next_token(), None);
        assert_eq!(cursor.rest(), before);
    }

    #[test]
    fn rest_is_the_unconsumed_tail() {
        let mut cursor = Cursor::new("sym = some long value");
        cursor.next_token();
        cursor.next_token();
        assert_eq!(cursor.rest(), "some long value");
    }
}
